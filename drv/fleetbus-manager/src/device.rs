// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices: one addressable peripheral each.
//!
//! A concrete device type (a servo model, an IMU, …) is a plug-in: a struct
//! holding its typed registers as `Arc` fields plus a [`DeviceCore`], and an
//! implementation of [`DeviceModel`] that declares those registers and its
//! parameters in `on_init`. The manager and registry only ever see the
//! object-safe [`FleetDevice`] face.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use drv_fleetbus_api::{
    DeviceId, ParameterList, ResponseState, TypeNumber,
};

use crate::aggregation::RegValue;
use crate::error::FleetError;
use crate::register::{CallManager, RawRegister, TypedRegister};
use crate::registers::RegisterSet;

/// Point-in-time copy of a device's health state.
#[derive(Copy, Clone, Debug, Default)]
pub struct HealthSnapshot {
    /// The device answered its most recent exchange.
    pub present: bool,
    /// The most recent exchange carried a status warning
    /// (overload/overheat/bad voltage/alert).
    pub warning: bool,
    /// The most recent exchange carried a link or device error.
    pub error: bool,
    /// Flags of the last warning- or error-carrying response.
    pub last_flags: ResponseState,
    pub count_warnings: u64,
    pub count_errors: u64,
    pub count_missings: u64,
}

#[derive(Default)]
struct Health {
    present: bool,
    warning: bool,
    error: bool,
    last_flags: ResponseState,
    count_warnings: u64,
    count_errors: u64,
    count_missings: u64,
}

/// Identity, registers, parameters, and health of one device.
///
/// Every concrete device embeds one of these and exposes it through
/// [`FleetDevice::core`].
pub struct DeviceCore {
    name: String,
    id: DeviceId,
    registers: RegisterSet,
    parameters: Mutex<ParameterList>,
    manager: OnceLock<Weak<dyn CallManager>>,
    health: Mutex<Health>,
}

impl DeviceCore {
    pub fn new(name: &str, id: DeviceId) -> Self {
        let mut parameters = ParameterList::new();
        // Always present: exclude this device from periodic reads.
        let _ = parameters.add_bool("dontRead", false);
        Self {
            name: name.to_string(),
            id,
            registers: RegisterSet::new(),
            parameters: Mutex::new(parameters),
            manager: OnceLock::new(),
            health: Mutex::new(Health::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    /// Locked access to the device's parameters.
    pub fn parameters(&self) -> MutexGuard<'_, ParameterList> {
        self.parameters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether periodic reads skip this device.
    pub fn dont_read(&self) -> bool {
        self.parameters().get_bool("dontRead").unwrap_or(false)
    }

    /// Attaches the device to its manager. Called by the registry before
    /// `on_init`.
    pub(crate) fn bind(&self, manager: Weak<dyn CallManager>) {
        let _ = self.manager.set(manager);
    }

    /// Declares a register: collision checks, manager attachment, and the
    /// manager's sorted-view notification, in that order.
    pub fn add_register<T: RegValue>(
        &self,
        reg: &Arc<TypedRegister<T>>,
    ) -> Result<(), FleetError> {
        let manager = self
            .manager
            .get()
            .ok_or_else(|| FleetError::NotAttached(self.name.clone()))?;
        let raw: Arc<dyn RawRegister> = Arc::clone(reg) as Arc<dyn RawRegister>;
        self.registers.add(Arc::clone(&raw))?;
        reg.bind(self.id, manager.clone());
        if let Some(manager) = manager.upgrade() {
            manager.on_new_register(raw);
        }
        Ok(())
    }

    fn health_lock(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_present(&self) -> bool {
        self.health_lock().present
    }

    pub fn is_warning(&self) -> bool {
        self.health_lock().warning
    }

    pub fn is_error(&self) -> bool {
        self.health_lock().error
    }

    /// Flags of the last warning- or error-carrying response.
    pub fn last_flags(&self) -> ResponseState {
        self.health_lock().last_flags
    }

    pub fn count_warnings(&self) -> u64 {
        self.health_lock().count_warnings
    }

    pub fn count_errors(&self) -> u64 {
        self.health_lock().count_errors
    }

    pub fn count_missings(&self) -> u64 {
        self.health_lock().count_missings
    }

    pub fn health(&self) -> HealthSnapshot {
        let h = self.health_lock();
        HealthSnapshot {
            present: h.present,
            warning: h.warning,
            error: h.error,
            last_flags: h.last_flags,
            count_warnings: h.count_warnings,
            count_errors: h.count_errors,
            count_missings: h.count_missings,
        }
    }

    /// Presence update from ping/scan probes.
    pub(crate) fn set_present(&self, present: bool) {
        let mut h = self.health_lock();
        if h.present && !present {
            h.count_missings += 1;
        }
        h.present = present;
    }

    /// Health update from one protocol response, per the response-state
    /// bits: presence from `QUIET`, warning and error from their bit
    /// classes, counters on transitions into the flagged state.
    pub(crate) fn note_response(&self, state: ResponseState) {
        let mut h = self.health_lock();
        let present = !state.is_quiet();
        if h.present && !present {
            h.count_missings += 1;
        }
        h.present = present;

        let warning = state.is_warning();
        if warning && !h.warning {
            h.count_warnings += 1;
        }
        h.warning = warning;

        let error = state.is_error();
        if error && !h.error {
            h.count_errors += 1;
        }
        h.error = error;

        if warning || error {
            h.last_flags = state;
        }
    }
}

/// Object-safe device face the manager and registries operate on.
pub trait FleetDevice: Send + Sync {
    fn core(&self) -> &DeviceCore;

    /// Hook run every cycle, after the swap and before batch selection.
    fn on_swap(&self) {}

    /// Pushes parameter-derived values onto hardware registers (angle
    /// limits and the like). Run for present devices by
    /// `Manager::set_devices_config`.
    fn set_config(&self) -> Result<(), FleetError> {
        Ok(())
    }
}

/// Plug-in contract for a concrete device type.
pub trait DeviceModel: FleetDevice + Sized + 'static {
    /// Model number as reported by the hardware's model register.
    const TYPE_NUMBER: TypeNumber;
    /// Type name used as JSON key and display string.
    const TYPE_NAME: &'static str;

    /// Constructs the device shell: registers exist but are not yet
    /// declared.
    fn new(name: &str, id: DeviceId) -> Arc<Self>;

    /// Declares registers and parameters into [`FleetDevice::core`]. Called
    /// exactly once, after the device is attached to a manager.
    fn on_init(&self) -> Result<(), FleetError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// CallManager stand-in recording force calls.
    #[derive(Default)]
    pub(crate) struct FakeCall {
        pub schedule_mode: Mutex<bool>,
        pub force_reads: Mutex<Vec<(DeviceId, String)>>,
        pub force_writes: Mutex<Vec<(DeviceId, String)>>,
        pub new_registers: Mutex<Vec<Arc<dyn RawRegister>>>,
    }

    impl FakeCall {
        pub(crate) fn scheduled() -> Arc<Self> {
            Arc::new(Self {
                schedule_mode: Mutex::new(true),
                ..Self::default()
            })
        }
    }

    impl CallManager for FakeCall {
        fn is_schedule_mode(&self) -> bool {
            *self.schedule_mode.lock().unwrap()
        }

        fn force_register_read(
            &self,
            id: DeviceId,
            name: &str,
        ) -> Result<(), FleetError> {
            self.force_reads.lock().unwrap().push((id, name.to_string()));
            Ok(())
        }

        fn force_register_write(
            &self,
            id: DeviceId,
            name: &str,
        ) -> Result<(), FleetError> {
            self.force_writes.lock().unwrap().push((id, name.to_string()));
            Ok(())
        }

        fn on_new_register(&self, reg: Arc<dyn RawRegister>) {
            self.new_registers.lock().unwrap().push(reg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeCall;
    use super::*;
    use crate::register::{codec, RegisterDesc};

    fn downgrade_dyn(call: &Arc<FakeCall>) -> Weak<dyn CallManager> {
        let strong: Arc<dyn CallManager> = Arc::clone(call) as Arc<dyn CallManager>;
        Arc::downgrade(&strong)
    }

    fn make_reg(name: &str, addr: u8) -> Arc<TypedRegister<i64>> {
        TypedRegister::new(
            RegisterDesc::new(name, addr, 2).unwrap(),
            codec::encode_u16_le,
            codec::decode_u16_le,
        )
    }

    #[test]
    fn add_register_requires_attachment() {
        let core = DeviceCore::new("servo", DeviceId(3));
        let reg = make_reg("goal", 0x1e);
        assert!(matches!(
            core.add_register(&reg),
            Err(FleetError::NotAttached(_))
        ));
    }

    #[test]
    fn add_register_binds_and_notifies() {
        let call = FakeCall::scheduled();
        let core = DeviceCore::new("servo", DeviceId(3));
        core.bind(downgrade_dyn(&call));

        let reg = make_reg("goal", 0x1e);
        core.add_register(&reg).unwrap();

        assert_eq!(
            (reg.as_ref() as &dyn RawRegister).device_id(),
            Some(DeviceId(3))
        );
        assert_eq!(call.new_registers.lock().unwrap().len(), 1);
        assert!(core.registers().exists("goal"));
    }

    #[test]
    fn force_write_routes_through_manager() {
        let call = FakeCall::scheduled();
        let core = DeviceCore::new("servo", DeviceId(7));
        core.bind(downgrade_dyn(&call));

        let reg = TypedRegister::new(
            RegisterDesc::new("torque", 0x18, 2).unwrap().force_write(),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        core.add_register(&reg).unwrap();
        reg.write(1).unwrap();

        let writes = call.force_writes.lock().unwrap();
        assert_eq!(&*writes, &[(DeviceId(7), "torque".to_string())]);
    }

    #[test]
    fn immediate_mode_forces_every_access() {
        let call = Arc::new(FakeCall::default()); // schedule_mode = false
        let core = DeviceCore::new("servo", DeviceId(7));
        core.bind(downgrade_dyn(&call));

        let reg = make_reg("goal", 0x1e);
        core.add_register(&reg).unwrap();

        reg.write(5).unwrap();
        reg.read().unwrap();
        assert_eq!(call.force_writes.lock().unwrap().len(), 1);
        assert_eq!(call.force_reads.lock().unwrap().len(), 1);
    }

    #[test]
    fn health_transitions_count_once() {
        let core = DeviceCore::new("servo", DeviceId(3));
        let ok = ResponseState::OK;
        let hot = ResponseState::OK | ResponseState::OVERHEAT;

        core.note_response(ok);
        assert!(core.is_present());
        assert_eq!(core.count_warnings(), 0);

        core.note_response(hot);
        core.note_response(hot);
        assert!(core.is_warning());
        // Still one warning transition.
        assert_eq!(core.count_warnings(), 1);
        assert_eq!(core.last_flags(), hot);

        core.note_response(ok);
        assert!(!core.is_warning());
        core.note_response(hot);
        assert_eq!(core.count_warnings(), 2);

        core.note_response(ResponseState::QUIET);
        assert!(!core.is_present());
        assert_eq!(core.count_missings(), 1);

        core.note_response(ResponseState::BAD_CHECKSUM);
        assert!(core.is_error());
        assert_eq!(core.count_errors(), 1);
    }

    #[test]
    fn dont_read_parameter() {
        let core = DeviceCore::new("servo", DeviceId(3));
        assert!(!core.dont_read());
        core.parameters().set_bool("dontRead", true).unwrap();
        assert!(core.dont_read());
    }
}
