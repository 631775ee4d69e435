//! Address-state overlay of a transaction and the EPR policy seam.

use std::collections::BTreeMap;

use crate::types::{Address, Family};

/// Effect of the operations reserved so far on one block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlayBlock {
    pub erased: bool,
    /// Highest page programmed in this transaction.
    pub programmed_through: Option<u32>,
    pub celltype: Option<String>,
    pub read_pages: Vec<u32>,
}

/// What the pending reservations of a transaction would do to addresses.
#[derive(Clone, Debug, Default)]
pub struct AddressOverlay {
    blocks: BTreeMap<(u32, u32), OverlayBlock>,
}

impl AddressOverlay {
    pub fn record(&mut self, family: Option<Family>, targets: &[Address], celltype: Option<&str>) {
        let Some(family) = family else {
            return;
        };
        for addr in targets {
            let block = self.blocks.entry((addr.die, addr.block)).or_default();
            match family {
                Family::Erase => {
                    *block = OverlayBlock {
                        erased: true,
                        celltype: celltype.map(str::to_string),
                        ..OverlayBlock::default()
                    };
                }
                Family::Program => {
                    if let Some(page) = addr.page {
                        block.programmed_through =
                            Some(block.programmed_through.map_or(page, |p| p.max(page)));
                    }
                    if block.celltype.is_none() {
                        block.celltype = celltype.map(str::to_string);
                    }
                }
                Family::Read => {
                    if let Some(page) = addr.page {
                        block.read_pages.push(page);
                    }
                }
            }
        }
    }

    pub fn block(&self, die: u32, block: u32) -> Option<&OverlayBlock> {
        self.blocks.get(&(die, block))
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Input of an EPR evaluation.
#[derive(Clone, Copy, Debug)]
pub struct EprQuery<'a> {
    pub base: &'a str,
    pub family: Option<Family>,
    pub targets: &'a [Address],
    pub celltype: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EprFailure {
    BadBlock(Address),
    ProgramBeforeErase(Address),
    /// Program of a page at or below the block's program cursor.
    DuplicatePageProgram(Address),
    /// Read of a page not yet programmed past the guard offset.
    ReadBeforeProgram(Address),
    MixedCelltype(Address),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EprVerdict {
    pub failures: Vec<EprFailure>,
}

impl EprVerdict {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Address-dependent rule evaluation. Implementations see committed address
/// state plus the overlay of the transaction being built.
pub trait EprPolicy {
    fn check_epr(&self, query: &EprQuery<'_>, overlay: &AddressOverlay) -> EprVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_tracks_erase_then_program() {
        let mut overlay = AddressOverlay::default();
        overlay.record(Some(Family::Erase), &[Address::block(0, 1, 5)], Some("SLC"));
        overlay.record(
            Some(Family::Program),
            &[Address::new(0, 1, 5, Some(0)), Address::new(0, 1, 5, Some(1))],
            Some("SLC"),
        );
        let block = overlay.block(0, 5).unwrap();
        assert!(block.erased);
        assert_eq!(block.programmed_through, Some(1));
        assert_eq!(block.celltype.as_deref(), Some("SLC"));
        assert!(overlay.block(0, 6).is_none());
    }

    #[test]
    fn test_non_family_ops_leave_no_trace() {
        let mut overlay = AddressOverlay::default();
        overlay.record(None, &[Address::block(0, 0, 1)], None);
        assert!(overlay.is_empty());
    }
}
