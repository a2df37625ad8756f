//! TCS group table
//!
//! The channel's TCSes are split once, at probe, into Active, Sleep, Wake and
//! Control groups. Ranges are assigned in configuration order and never
//! overlap. The control block is separate hardware and takes no index from
//! the pool.

use super::regs::HardwareInfo;
use super::slots::SlotArena;
use crate::config::GroupConfig;
use crate::error::{ProbeError, TcsError};
use crate::types::{QueueId, RpmhState, TcsType, MAX_CMDS_PER_TCS, MAX_TCS_PER_TYPE};
use parking_lot::{Mutex, MutexGuard};

/// Interrupt status is one 32-bit word, one bit per TCS
pub const MAX_QUEUES_PER_CHANNEL: usize = 32;

pub struct TcsGroup {
    pub ty: TcsType,
    /// First absolute TCS index of the group
    pub offset: usize,
    pub num_tcs: usize,
    pub ncpt: usize,
    /// Interrupt status bits owned by the group
    pub mask: u32,
    state: Mutex<GroupState>,
}

/// Everything guarded by the group lock
pub struct GroupState {
    /// Present for Sleep and Wake groups
    pub slots: Option<SlotArena>,
}

impl TcsGroup {
    fn new(ty: TcsType, offset: usize, num_tcs: usize, ncpt: usize) -> Self {
        let pooled = ty != TcsType::Control;
        let mask = if pooled && num_tcs > 0 {
            (((1u64 << num_tcs) - 1) << offset) as u32
        } else {
            0
        };
        let slots = ty.is_cached().then(|| SlotArena::new(num_tcs, ncpt));
        Self {
            ty,
            offset,
            num_tcs,
            ncpt,
            mask,
            state: Mutex::new(GroupState { slots }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }

    pub fn queues(&self) -> impl Iterator<Item = QueueId> {
        (self.offset..self.offset + self.num_tcs).map(QueueId)
    }

    pub fn contains(&self, queue: QueueId) -> bool {
        self.mask & queue.bit() != 0
    }
}

/// Fixed table of the four groups, indexed by [`TcsType`]
pub struct GroupTable {
    groups: [TcsGroup; TcsType::COUNT],
    num_tcs: usize,
}

impl GroupTable {
    pub fn probe(config: &[GroupConfig], hw: HardwareInfo) -> Result<Self, ProbeError> {
        if hw.ncpt == 0 || hw.ncpt > MAX_CMDS_PER_TCS {
            return Err(ProbeError::Geometry(format!(
                "{} commands per TCS, expected 1..={}",
                hw.ncpt, MAX_CMDS_PER_TCS
            )));
        }

        let mut slots: [Option<TcsGroup>; TcsType::COUNT] = Default::default();
        let mut next = 0;
        for entry in config {
            if entry.count > MAX_TCS_PER_TYPE {
                return Err(ProbeError::CountAboveCap {
                    ty: entry.ty,
                    count: entry.count,
                    max: MAX_TCS_PER_TYPE,
                });
            }
            let slot = &mut slots[entry.ty.index()];
            if slot.is_some() {
                return Err(ProbeError::DuplicateType(entry.ty));
            }
            *slot = Some(TcsGroup::new(entry.ty, next, entry.count, hw.ncpt));
            if entry.ty != TcsType::Control {
                next += entry.count;
            }
        }

        if next > hw.max_tcs {
            return Err(ProbeError::TooManyQueues {
                requested: next,
                available: hw.max_tcs,
            });
        }
        if next > MAX_QUEUES_PER_CHANNEL {
            return Err(ProbeError::Geometry(format!(
                "{} TCSes do not fit the interrupt status word",
                next
            )));
        }

        let [active, sleep, wake, control] = slots;
        let take = |g: Option<TcsGroup>, ty| g.ok_or(ProbeError::MissingType(ty));
        let groups = [
            take(active, TcsType::Active)?,
            take(sleep, TcsType::Sleep)?,
            take(wake, TcsType::Wake)?,
            take(control, TcsType::Control)?,
        ];

        for g in &groups {
            log::debug!(
                "{} group: {} TCS at offset {}, mask {:#x}",
                g.ty,
                g.num_tcs,
                g.offset,
                g.mask
            );
        }

        Ok(Self {
            groups,
            num_tcs: next,
        })
    }

    pub fn get(&self, ty: TcsType) -> &TcsGroup {
        &self.groups[ty.index()]
    }

    /// Group serving `state`; an empty group cannot take the request
    pub fn for_state(&self, state: RpmhState) -> Result<&TcsGroup, TcsError> {
        let group = self.get(TcsType::for_state(state));
        if group.num_tcs == 0 {
            return Err(TcsError::InvalidRequest("no TCS configured for state"));
        }
        Ok(group)
    }

    /// Group owning a pooled TCS index
    pub fn group_of(&self, queue: QueueId) -> Option<&TcsGroup> {
        self.groups.iter().find(|g| g.contains(queue))
    }

    /// TCSes drawn from the pool
    pub fn num_tcs(&self) -> usize {
        self.num_tcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: HardwareInfo = HardwareInfo {
        max_tcs: 10,
        ncpt: 16,
    };

    fn table(entries: &[(TcsType, usize)]) -> Vec<GroupConfig> {
        entries.iter().map(|&(ty, n)| GroupConfig::new(ty, n)).collect()
    }

    #[test]
    fn ranges_follow_table_order() {
        let config = table(&[
            (TcsType::Sleep, 3),
            (TcsType::Wake, 3),
            (TcsType::Control, 1),
            (TcsType::Active, 2),
        ]);
        let groups = GroupTable::probe(&config, HW).unwrap();

        let sleep = groups.get(TcsType::Sleep);
        assert_eq!((sleep.offset, sleep.mask), (0, 0b111));
        let wake = groups.get(TcsType::Wake);
        assert_eq!((wake.offset, wake.mask), (3, 0b111_000));
        let active = groups.get(TcsType::Active);
        assert_eq!((active.offset, active.mask), (6, 0b11 << 6));
        assert_eq!(groups.get(TcsType::Control).mask, 0);
        assert_eq!(groups.num_tcs(), 8);

        assert_eq!(groups.group_of(QueueId(7)).map(|g| g.ty), Some(TcsType::Active));
        assert!(groups.group_of(QueueId(8)).is_none());
        assert_eq!(
            active.queues().collect::<Vec<_>>(),
            vec![QueueId(6), QueueId(7)]
        );

        let slots = sleep.lock();
        assert_eq!(slots.slots.as_ref().map(|s| s.capacity()), Some(48));
        assert!(active.lock().slots.is_none());
    }

    #[test]
    fn rejects_bad_tables() {
        let over_cap = table(&[(TcsType::Active, 4)]);
        assert!(matches!(
            GroupTable::probe(&over_cap, HW),
            Err(ProbeError::CountAboveCap { count: 4, .. })
        ));

        let dup = table(&[(TcsType::Active, 1), (TcsType::Active, 1)]);
        assert!(matches!(
            GroupTable::probe(&dup, HW),
            Err(ProbeError::DuplicateType(TcsType::Active))
        ));

        let missing = table(&[(TcsType::Active, 1), (TcsType::Sleep, 1), (TcsType::Wake, 1)]);
        assert!(matches!(
            GroupTable::probe(&missing, HW),
            Err(ProbeError::MissingType(TcsType::Control))
        ));

        let full = table(&[
            (TcsType::Active, 3),
            (TcsType::Sleep, 3),
            (TcsType::Wake, 3),
            (TcsType::Control, 0),
        ]);
        let small = HardwareInfo { max_tcs: 8, ncpt: 16 };
        assert!(matches!(
            GroupTable::probe(&full, small),
            Err(ProbeError::TooManyQueues {
                requested: 9,
                available: 8
            })
        ));

        let wide = HardwareInfo { max_tcs: 10, ncpt: 17 };
        assert!(matches!(
            GroupTable::probe(&full, wide),
            Err(ProbeError::Geometry(_))
        ));
    }

    #[test]
    fn empty_group_refuses_its_state() {
        let config = table(&[
            (TcsType::Active, 0),
            (TcsType::Sleep, 1),
            (TcsType::Wake, 1),
            (TcsType::Control, 0),
        ]);
        let groups = GroupTable::probe(&config, HW).unwrap();
        assert!(matches!(
            groups.for_state(RpmhState::ActiveOnly),
            Err(TcsError::InvalidRequest(_))
        ));
        assert_eq!(groups.for_state(RpmhState::Sleep).unwrap().ty, TcsType::Sleep);
        assert_eq!(groups.get(TcsType::Active).mask, 0);
    }
}
