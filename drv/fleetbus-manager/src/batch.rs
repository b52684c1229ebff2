// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch plan computation.
//!
//! Input: the cycle's selected registers, in the manager's canonical order
//! (device id, then address). Output: the fewest wire transactions that
//! cover exactly that selection.
//!
//! Two coalescing rules, applied in one pass:
//!
//! 1. A run of selected registers on the *same device* whose windows are
//!    address-contiguous collapses into one window.
//! 2. A closed window merges into an already-emitted plan entry iff the
//!    synchronized form is enabled for this direction and both cover the
//!    identical `(addr, len)` window — yielding one synchronized
//!    transaction across many devices. Device order within an entry is
//!    arrival order, i.e. ascending id.

use drv_fleetbus_api::DeviceId;

/// One register as the planner sees it; its position in the input slice is
/// the index plan entries refer back to.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PlanReg {
    pub id: DeviceId,
    pub addr: u8,
    pub len: usize,
}

/// One bus transaction: a single `(addr, len)` window, one or more devices,
/// and per-device member register indices (into the caller's selection
/// list, in address order).
#[derive(Clone, Debug)]
pub struct BatchEntry {
    pub addr: u8,
    pub len: usize,
    pub ids: Vec<DeviceId>,
    pub regs: Vec<Vec<usize>>,
}

impl BatchEntry {
    fn start(reg: PlanReg, index: usize) -> Self {
        Self {
            addr: reg.addr,
            len: reg.len,
            ids: vec![reg.id],
            regs: vec![vec![index]],
        }
    }
}

fn merge(container: &mut Vec<BatchEntry>, mut batch: BatchEntry, sync: bool) {
    if sync {
        for existing in container.iter_mut() {
            if existing.addr == batch.addr && existing.len == batch.len {
                existing.ids.push(batch.ids[0]);
                existing.regs.push(batch.regs.swap_remove(0));
                return;
            }
        }
    }
    container.push(batch);
}

/// Computes the plan for one direction. `selected` must be sorted by
/// (device id, address); windows of one device must not overlap.
pub(crate) fn plan(selected: &[PlanReg], sync: bool) -> Vec<BatchEntry> {
    let mut container: Vec<BatchEntry> = Vec::new();
    let mut current: Option<BatchEntry> = None;

    for (index, reg) in selected.iter().copied().enumerate() {
        match current.as_mut() {
            None => current = Some(BatchEntry::start(reg, index)),
            Some(batch) => {
                let contiguous = batch.ids[0] == reg.id
                    && usize::from(batch.addr) + batch.len
                        == usize::from(reg.addr);
                if contiguous {
                    batch.len += reg.len;
                    batch.regs[0].push(index);
                } else if let Some(closed) = current.take() {
                    merge(&mut container, closed, sync);
                    current = Some(BatchEntry::start(reg, index));
                }
            }
        }
    }
    if let Some(closed) = current {
        merge(&mut container, closed, sync);
    }

    container
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reg(id: u8, addr: u8, len: usize) -> PlanReg {
        PlanReg {
            id: DeviceId(id),
            addr,
            len,
        }
    }

    #[test]
    fn empty_selection_empty_plan() {
        assert!(plan(&[], true).is_empty());
    }

    #[test]
    fn contiguous_registers_collapse_into_one_window() {
        // position@0x24, speed@0x26, load@0x28, all len 2 on one device.
        let sel = [reg(9, 0x24, 2), reg(9, 0x26, 2), reg(9, 0x28, 2)];
        let entries = plan(&sel, true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].addr, 0x24);
        assert_eq!(entries[0].len, 6);
        assert_eq!(entries[0].ids, vec![DeviceId(9)]);
        assert_eq!(entries[0].regs, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn same_window_across_devices_merges_when_sync_enabled() {
        let sel = [reg(2, 0x1e, 2), reg(3, 0x1e, 2), reg(5, 0x1e, 2)];
        let entries = plan(&sel, true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].addr, 0x1e);
        assert_eq!(entries[0].len, 2);
        assert_eq!(
            entries[0].ids,
            vec![DeviceId(2), DeviceId(3), DeviceId(5)]
        );
        assert_eq!(entries[0].regs, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn sync_disabled_keeps_per_device_entries() {
        let sel = [reg(2, 0x1e, 2), reg(3, 0x1e, 2), reg(5, 0x1e, 2)];
        let entries = plan(&sel, false);
        assert_eq!(entries.len(), 3);
        for (entry, id) in entries.iter().zip([2u8, 3, 5]) {
            assert_eq!(entry.ids, vec![DeviceId(id)]);
        }
    }

    #[test]
    fn mismatched_windows_do_not_merge() {
        // Device 4's window is longer; it cannot join the sync group.
        let sel = [reg(2, 0x1e, 2), reg(3, 0x1e, 2), reg(4, 0x1e, 4)];
        let entries = plan(&sel, true);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ids, vec![DeviceId(2), DeviceId(3)]);
        assert_eq!(entries[1].ids, vec![DeviceId(4)]);
        assert_eq!(entries[1].len, 4);
    }

    #[test]
    fn gap_splits_windows_then_sync_merges_equals() {
        // Device 2: 0x10..0x12 and 0x20..0x22 (gap). Device 3: 0x20..0x22.
        let sel = [reg(2, 0x10, 2), reg(2, 0x20, 2), reg(3, 0x20, 2)];
        let entries = plan(&sel, true);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].addr, 0x10);
        assert_eq!(entries[0].ids, vec![DeviceId(2)]);
        assert_eq!(entries[1].addr, 0x20);
        assert_eq!(entries[1].ids, vec![DeviceId(2), DeviceId(3)]);
    }

    #[test]
    fn contiguous_run_merges_with_earlier_sync_group() {
        // Devices 2 and 3 both read 0x24..0x2a as three registers; the two
        // collapsed windows are identical and merge into one sync read.
        let sel = [
            reg(2, 0x24, 2),
            reg(2, 0x26, 2),
            reg(2, 0x28, 2),
            reg(3, 0x24, 2),
            reg(3, 0x26, 2),
            reg(3, 0x28, 2),
        ];
        let entries = plan(&sel, true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].len, 6);
        assert_eq!(entries[0].ids, vec![DeviceId(2), DeviceId(3)]);
        assert_eq!(entries[0].regs, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    /// Sorted, non-overlapping selections across a handful of devices.
    fn selections() -> impl Strategy<Value = Vec<PlanReg>> {
        proptest::collection::vec((1u8..6, 0u8..40, 1usize..5), 0..24).prop_map(
            |mut raw| {
                raw.sort_by_key(|&(id, addr, _)| (id, addr));
                let mut out: Vec<PlanReg> = Vec::new();
                for (id, addr, len) in raw {
                    // Windows start on multiples of four and are at most
                    // four bytes long, so distinct starts never overlap.
                    let addr = addr * 4;
                    let clash = out
                        .iter()
                        .any(|r| r.id == DeviceId(id) && r.addr == addr);
                    if !clash {
                        out.push(PlanReg {
                            id: DeviceId(id),
                            addr,
                            len: len.min(4),
                        });
                    }
                }
                out
            },
        )
    }

    proptest! {
        /// The plan covers exactly the selection: every selected register
        /// appears in exactly one entry, entry windows equal the sum of
        /// their members, and per-entry device windows are identical.
        #[test]
        fn plan_covers_selection_exactly(
            sel in selections(),
            sync in proptest::bool::ANY,
        ) {
            let entries = plan(&sel, sync);

            let mut seen = vec![0usize; sel.len()];
            for entry in &entries {
                prop_assert_eq!(entry.ids.len(), entry.regs.len());
                for (slot, members) in entry.ids.iter().zip(&entry.regs) {
                    let mut cursor = usize::from(entry.addr);
                    for &index in members {
                        seen[index] += 1;
                        let r = sel[index];
                        prop_assert_eq!(r.id, *slot);
                        // Members tile the window contiguously.
                        prop_assert_eq!(usize::from(r.addr), cursor);
                        cursor += r.len;
                    }
                    prop_assert_eq!(
                        cursor,
                        usize::from(entry.addr) + entry.len
                    );
                }
            }
            // No duplicates, no omissions.
            prop_assert!(seen.iter().all(|&n| n == 1));

            // Without sync, every entry addresses exactly one device.
            if !sync {
                prop_assert!(entries.iter().all(|e| e.ids.len() == 1));
            }
        }
    }
}
