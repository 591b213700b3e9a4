//! Identity of a calling thread within the parallel execution context

use crate::config::GROUP_SIZE;

/// Where a calling thread sits in the execution hierarchy
///
/// Lanes are grouped into lock-step groups of [GROUP_SIZE], groups are
/// scheduled onto processing units. None of these values affect correctness;
/// they only seed the placement hash and the bitmap probing start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LaneId {
    /// Index within the lock-step group (`0..GROUP_SIZE`)
    pub lane: u32,
    /// Lock-step group index
    pub group: u32,
    /// Processing unit the group runs on
    pub unit: u32,
}

impl LaneId {
    /// Identity used by a caller outside any parallel context
    pub const SERIAL: LaneId = LaneId {
        lane: 0,
        group: 0,
        unit: 0,
    };

    pub const fn new(lane: u32, group: u32, unit: u32) -> Self {
        Self {
            lane: lane % GROUP_SIZE,
            group,
            unit,
        }
    }

    /// Derive an identity from a flat thread index, the way a launch
    /// would number threads: consecutive indices share a group,
    /// `groups_per_unit` consecutive groups share a unit
    pub const fn from_linear(idx: u32, groups_per_unit: u32) -> Self {
        let group = idx / GROUP_SIZE;
        Self {
            lane: idx % GROUP_SIZE,
            group,
            unit: group / groups_per_unit,
        }
    }

    /// Only the first lane of the first group updates some shared hints
    pub(crate) const fn is_hint_writer(&self) -> bool {
        self.lane == 0 && self.group == 0
    }
}
