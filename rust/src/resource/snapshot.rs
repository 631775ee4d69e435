//! Serializable snapshot of the committed resource state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::SimTime;

use super::spans::SpanIndex;
use super::timeline::StateTimeline;
use super::types::{DieAxes, ExclusionWindow, LatchEntry, ResumeError, StateInterval, Window};
use super::ResourceManager;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Snapshot topology {snapshot_dies}x{snapshot_planes} does not match {dies}x{planes}")]
    TopologyMismatch {
        snapshot_dies: u32,
        snapshot_planes: u32,
        dies: u32,
        planes: u32,
    },
    #[error("Snapshot is inconsistent: {0}")]
    Inconsistent(String),
    #[error("Failed to decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Everything the resource manager has committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub dies: u32,
    pub planes: u32,
    pub avail: Vec<SimTime>,
    pub plane_windows: Vec<Vec<Window>>,
    pub bus: Vec<Window>,
    pub exclusions: Vec<ExclusionWindow>,
    pub latches: Vec<(u32, u32, LatchEntry)>,
    pub timeline: Vec<StateInterval>,
    pub axes: Vec<DieAxes>,
    pub odt_disabled: bool,
    pub cache_read: Vec<(u32, u32, SimTime)>,
    pub cache_program: Vec<(u32, SimTime)>,
    pub next_uid: u64,
    pub last_error: Option<ResumeError>,
}

impl ResourceSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, RestoreError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ResourceManager {
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            dies: self.dies,
            planes: self.planes,
            avail: self.avail.clone(),
            plane_windows: self.plane_windows.iter().map(|w| w.to_vec()).collect(),
            bus: self.bus.to_vec(),
            exclusions: self
                .global_exclusions
                .iter()
                .chain(self.die_exclusions.iter().flat_map(|x| x.iter()))
                .cloned()
                .collect(),
            latches: self
                .latches
                .iter()
                .map(|((die, plane, _), entry)| (*die, *plane, *entry))
                .collect(),
            timeline: self.timeline.intervals().cloned().collect(),
            axes: self.axes.clone(),
            odt_disabled: self.odt_disabled,
            cache_read: self
                .cache_read
                .iter()
                .map(|((d, p), t)| (*d, *p, *t))
                .collect(),
            cache_program: self.cache_program.iter().map(|(d, t)| (*d, *t)).collect(),
            next_uid: self.next_uid,
            last_error: self.last_error.clone(),
        }
    }

    /// Replace the committed state with `snapshot`. Nothing changes on error.
    pub fn restore(&mut self, snapshot: &ResourceSnapshot) -> Result<(), RestoreError> {
        if snapshot.dies != self.dies || snapshot.planes != self.planes {
            return Err(RestoreError::TopologyMismatch {
                snapshot_dies: snapshot.dies,
                snapshot_planes: snapshot.planes,
                dies: self.dies,
                planes: self.planes,
            });
        }
        let plane_count = (self.dies * self.planes) as usize;
        if snapshot.avail.len() != plane_count
            || snapshot.plane_windows.len() != plane_count
            || snapshot.axes.len() != self.dies as usize
        {
            return Err(RestoreError::Inconsistent(
                "per-plane or per-die tables have the wrong length".to_string(),
            ));
        }
        let in_range = |die: u32, plane: u32| die < self.dies && plane < self.planes;
        if snapshot
            .exclusions
            .iter()
            .any(|x| x.die.is_some_and(|d| d >= self.dies))
            || snapshot.latches.iter().any(|(d, p, _)| !in_range(*d, *p))
            || snapshot.timeline.iter().any(|iv| !in_range(iv.die, iv.plane))
            || snapshot.cache_read.iter().any(|(d, p, _)| !in_range(*d, *p))
        {
            return Err(RestoreError::Inconsistent(
                "entry addresses a die or plane outside the topology".to_string(),
            ));
        }

        let mut die_exclusions: Vec<SpanIndex<ExclusionWindow>> =
            (0..self.dies).map(|_| SpanIndex::new()).collect();
        let mut global_exclusions = SpanIndex::new();
        for window in &snapshot.exclusions {
            match window.die {
                Some(die) => die_exclusions[die as usize].insert(window.clone()),
                None => global_exclusions.insert(window.clone()),
            }
        }

        self.avail = snapshot.avail.clone();
        self.plane_windows = snapshot
            .plane_windows
            .iter()
            .map(|w| SpanIndex::from_items(w.iter().copied()))
            .collect();
        self.bus = SpanIndex::from_items(snapshot.bus.iter().copied());
        self.die_exclusions = die_exclusions;
        self.global_exclusions = global_exclusions;
        self.latches = snapshot
            .latches
            .iter()
            .map(|(die, plane, entry)| ((*die, *plane, entry.kind), *entry))
            .collect::<BTreeMap<_, _>>();
        self.timeline =
            StateTimeline::from_intervals(self.dies, self.planes, snapshot.timeline.iter().cloned());
        self.axes = snapshot.axes.clone();
        self.odt_disabled = snapshot.odt_disabled;
        self.cache_read = snapshot
            .cache_read
            .iter()
            .map(|(d, p, t)| ((*d, *p), *t))
            .collect();
        self.cache_program = snapshot.cache_program.iter().copied().collect();
        self.next_uid = snapshot.next_uid;
        self.last_error = snapshot.last_error.clone();
        Ok(())
    }
}
