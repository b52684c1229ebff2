// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device register container.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::error::FleetError;
use crate::register::RawRegister;

/// Name-indexed set of one device's registers, with collision checks.
///
/// Additions happen while a device declares itself (`on_init`); afterwards
/// the set is read-only in practice, shared between user threads and the
/// manager.
#[derive(Default)]
pub struct RegisterSet {
    regs: Mutex<IndexMap<String, Arc<dyn RawRegister>>>,
}

impl RegisterSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Arc<dyn RawRegister>>> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RawRegister>> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn RawRegister>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Admits a register after checking that its name is new and its
    /// address window shares no byte with any existing register.
    pub(crate) fn add(
        &self,
        reg: Arc<dyn RawRegister>,
    ) -> Result<(), FleetError> {
        let mut regs = self.lock();
        let desc = reg.desc();
        if regs.contains_key(desc.name()) {
            return Err(FleetError::DuplicateRegister(desc.name().to_string()));
        }
        let start = usize::from(desc.addr());
        let end = start + desc.len();
        for other in regs.values() {
            let o = other.desc();
            let o_start = usize::from(o.addr());
            let o_end = o_start + o.len();
            if start < o_end && o_start < end {
                return Err(FleetError::RegisterOverlap {
                    name: desc.name().to_string(),
                    other: o.name().to_string(),
                });
            }
        }
        regs.insert(desc.name().to_string(), reg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{codec, RegisterDesc, TypedRegister};

    fn reg(name: &str, addr: u8, len: usize) -> Arc<dyn RawRegister> {
        let desc = RegisterDesc::new(name, addr, len).unwrap();
        TypedRegister::<i64>::new(desc, codec::encode_u16_le, codec::decode_u16_le)
    }

    #[test]
    fn rejects_duplicate_name() {
        let set = RegisterSet::new();
        set.add(reg("goal", 0x1e, 2)).unwrap();
        assert!(matches!(
            set.add(reg("goal", 0x30, 2)),
            Err(FleetError::DuplicateRegister(_))
        ));
    }

    #[test]
    fn rejects_overlapping_windows() {
        let set = RegisterSet::new();
        set.add(reg("a", 0x10, 2)).unwrap();
        // Shares byte 0x11.
        assert!(matches!(
            set.add(reg("b", 0x11, 2)),
            Err(FleetError::RegisterOverlap { .. })
        ));
        // Identical window.
        assert!(matches!(
            set.add(reg("c", 0x10, 2)),
            Err(FleetError::RegisterOverlap { .. })
        ));
        // Adjacent is fine.
        set.add(reg("d", 0x12, 2)).unwrap();
        set.add(reg("e", 0x0e, 2)).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn lookup_by_name() {
        let set = RegisterSet::new();
        set.add(reg("position", 0x24, 2)).unwrap();
        assert!(set.exists("position"));
        assert!(!set.exists("speed"));
        assert_eq!(set.get("position").unwrap().desc().addr(), 0x24);
        assert_eq!(set.names(), vec!["position".to_string()]);
    }
}
