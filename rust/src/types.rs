//! Value types shared by the resource manager, proposer and scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulation time in microseconds on the single logical clock.
pub type SimTime = f64;

/// Identity of a reserved operation, allocated in reservation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpUid(pub u64);

impl fmt::Display for OpUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A physical target. `page` is absent for block-granular operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub die: u32,
    pub plane: u32,
    pub block: u32,
    pub page: Option<u32>,
}

impl Address {
    pub fn new(die: u32, plane: u32, block: u32, page: Option<u32>) -> Self {
        Self {
            die,
            plane,
            block,
            page,
        }
    }

    /// Block-granular address (no page).
    pub fn block(die: u32, plane: u32, block: u32) -> Self {
        Self::new(die, plane, block, None)
    }
}

/// Which availability and exclusion checks apply to an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Single point; no plane or die exclusivity.
    None,
    /// The operation's own target planes.
    PlaneSet,
    /// Every plane of the die.
    DieWide,
}

/// Single- or multi-plane classification used for die-level exclusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplicity {
    Single,
    Multi,
}

impl Multiplicity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Multiplicity::Single => "single",
            Multiplicity::Multi => "multi",
        }
    }
}

/// Address family an operation base draws its targets from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Erase,
    Program,
    Read,
}

impl Family {
    /// Infer the family from a base name the way operation tables are usually named.
    pub fn infer(base_name: &str) -> Option<Family> {
        let upper = base_name.to_ascii_uppercase();
        if upper.contains("SUSPEND") || upper.contains("RESUME") {
            return None;
        }
        if upper.contains("ERASE") {
            Some(Family::Erase)
        } else if upper.contains("PROGRAM") {
            Some(Family::Program)
        } else if upper.contains("READ") {
            Some(Family::Read)
        } else {
            None
        }
    }

    /// Suspend axis that tracks long-running operations of this family.
    pub fn axis(&self) -> Option<Axis> {
        match self {
            Family::Erase => Some(Axis::Erase),
            Family::Program => Some(Axis::Program),
            Family::Read => None,
        }
    }
}

/// One of the two independent per-die suspend state machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Erase,
    Program,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Erase => "erase",
            Axis::Program => "program",
        }
    }

    /// State name reported while an operation of this axis is suspended.
    pub fn suspended_state(&self) -> &'static str {
        match self {
            Axis::Erase => "ERASE_SUSPENDED",
            Axis::Program => "PROGRAM_SUSPENDED",
        }
    }

    /// State name reported while nothing is suspended on this axis.
    pub fn idle_state(&self) -> &'static str {
        match self {
            Axis::Erase => "NOT_ERASE_SUSPENDED",
            Axis::Program => "NOT_PROGRAM_SUSPENDED",
        }
    }
}

/// Kind of data-path hold a latch represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatchKind {
    Read,
    Lsb,
    Csb,
    Msb,
}

impl LatchKind {
    pub const ALL: [LatchKind; 4] = [
        LatchKind::Read,
        LatchKind::Lsb,
        LatchKind::Csb,
        LatchKind::Msb,
    ];

    /// State name used as the key of `exclusions_by_latch_state`.
    pub fn state_name(&self) -> &'static str {
        match self {
            LatchKind::Read => "LATCH_ON_READ",
            LatchKind::Lsb => "LATCH_ON_LSB",
            LatchKind::Csb => "LATCH_ON_CSB",
            LatchKind::Msb => "LATCH_ON_MSB",
        }
    }

    pub fn is_program(&self) -> bool {
        !matches!(self, LatchKind::Read)
    }
}

/// Bookkeeping a base triggers when its reservation is committed or ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseRole {
    #[default]
    Plain,
    EraseSuspend,
    EraseResume,
    ProgramSuspend,
    ProgramResume,
    OdtDisable,
    OdtEnable,
    CacheReadStart,
    CacheReadEnd,
    CacheProgramStart,
    CacheProgramEnd,
    /// Data-out; releases the plane's read latch when it ends.
    Dout,
    /// Final program execution; releases the die's program latches when it ends.
    ExecMsb,
}

impl BaseRole {
    pub fn suspend_axis(&self) -> Option<Axis> {
        match self {
            BaseRole::EraseSuspend => Some(Axis::Erase),
            BaseRole::ProgramSuspend => Some(Axis::Program),
            _ => None,
        }
    }

    pub fn resume_axis(&self) -> Option<Axis> {
        match self {
            BaseRole::EraseResume => Some(Axis::Erase),
            BaseRole::ProgramResume => Some(Axis::Program),
            _ => None,
        }
    }
}

/// Where an operation's exclusion window applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionScope {
    #[default]
    Die,
    Global,
}

/// Attribute a dependent operation inherits from its predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inherit {
    SameBlock,
    SamePage,
    IncPage,
    SameCelltype,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_inference() {
        assert_eq!(Family::infer("ERASE"), Some(Family::Erase));
        assert_eq!(Family::infer("PROGRAM_SLC"), Some(Family::Program));
        assert_eq!(Family::infer("CACHE_READ"), Some(Family::Read));
        assert_eq!(Family::infer("ERASE_SUSPEND"), None);
        assert_eq!(Family::infer("SR"), None);
    }

    #[test]
    fn test_scope_serde_names() {
        let scope: Scope = serde_json::from_str("\"DIE_WIDE\"").unwrap();
        assert_eq!(scope, Scope::DieWide);
        let role: BaseRole = serde_json::from_str("\"erase_suspend\"").unwrap();
        assert_eq!(role.suspend_axis(), Some(Axis::Erase));
    }
}
