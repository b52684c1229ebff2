// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cycle engine.
//!
//! One `Manager` owns the bus (through its `Protocol`), the aggregate
//! device registry, and the cycle machinery. Each `flush()`:
//!
//! 1. waits for every cooperative user thread at the first barrier,
//! 2. opens it, swaps freshly read values into user view, and runs each
//!    device's `on_swap` hook,
//! 3. selects registers for this cycle and computes the read and write
//!    plans,
//! 4. opens the second barrier, releasing user threads with both fresh
//!    data and this cycle's selection decisions,
//! 5. executes all write batches, then — after the slow-register settle
//!    delay, if any written register wants one — all read batches.
//!
//! Lock hierarchy, outermost first: cycle gate, bus, manager state,
//! register. Code only ever acquires downward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use cyclegate::CycleGate;
use drv_fleetbus_api::{
    Bus, DeviceId, NullBus, ParameterList, Protocol, ProtocolFactory,
    ResponseState, DEVICE_ID_MAX, DEVICE_ID_MIN, TYPE_NUMBER_ADDR,
};
use serde_json::Value;

use crate::batch::{self, BatchEntry, PlanReg};
use crate::device::{DeviceModel, FleetDevice};
use crate::error::FleetError;
use crate::register::{CallManager, RawRegister};
use crate::registry::{FleetRegistry, TypedAccess};
use crate::stats::Statistics;
use crate::{ID_ADDR, MAX_FORCE_RETRIES, MAX_REG_LEN, SLOW_REGISTER_DELAY};

type BusFactory =
    Box<dyn Fn(&str, u32) -> Result<Box<dyn Bus>, FleetError> + Send>;

struct ManagerState {
    schedule_mode: bool,
    port: String,
    baudrate: u32,
    protocol_name: String,
    enable_sync_read: bool,
    enable_sync_write: bool,
    wait_write_check: bool,
    throw_on_scan: bool,
    throw_on_read: bool,
    stats: Statistics,
    cycle_count: u64,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            schedule_mode: true,
            port: String::new(),
            baudrate: 1_000_000,
            protocol_name: "mock".to_string(),
            enable_sync_read: true,
            enable_sync_write: true,
            wait_write_check: true,
            throw_on_scan: true,
            throw_on_read: true,
            stats: Statistics::default(),
            cycle_count: 0,
        }
    }
}

impl ManagerState {
    fn to_params(&self) -> ParameterList {
        let mut p = ParameterList::new();
        let _ = p.add_bool("scheduleMode", true);
        let _ = p.add_str("port", "");
        let _ = p.add_number("baudrate", 1_000_000.0);
        let _ = p.add_str("protocol", "mock");
        let _ = p.add_bool("enableSyncRead", true);
        let _ = p.add_bool("enableSyncWrite", true);
        let _ = p.add_bool("waitWriteCheckResponse", true);
        let _ = p.add_bool("throwErrorOnScan", true);
        let _ = p.add_bool("throwErrorOnRead", true);

        let _ = p.set_bool("scheduleMode", self.schedule_mode);
        let _ = p.set_str("port", &self.port);
        let _ = p.set_number("baudrate", f64::from(self.baudrate));
        let _ = p.set_str("protocol", &self.protocol_name);
        let _ = p.set_bool("enableSyncRead", self.enable_sync_read);
        let _ = p.set_bool("enableSyncWrite", self.enable_sync_write);
        let _ = p.set_bool("waitWriteCheckResponse", self.wait_write_check);
        let _ = p.set_bool("throwErrorOnScan", self.throw_on_scan);
        let _ = p.set_bool("throwErrorOnRead", self.throw_on_read);
        p
    }

    fn apply_params(&mut self, p: &ParameterList) -> Result<(), FleetError> {
        self.schedule_mode = p.get_bool("scheduleMode")?;
        self.port = p.get_str("port")?.to_string();
        self.baudrate = p.get_number("baudrate")? as u32;
        self.protocol_name = p.get_str("protocol")?.to_string();
        self.enable_sync_read = p.get_bool("enableSyncRead")?;
        self.enable_sync_write = p.get_bool("enableSyncWrite")?;
        self.wait_write_check = p.get_bool("waitWriteCheckResponse")?;
        self.throw_on_scan = p.get_bool("throwErrorOnScan")?;
        self.throw_on_read = p.get_bool("throwErrorOnRead")?;
        Ok(())
    }
}

struct BusState {
    protocol: Option<Box<dyn Protocol>>,
    factories: Vec<Box<dyn ProtocolFactory>>,
    bus_factory: Option<BusFactory>,
}

pub(crate) struct ManagerShared {
    state: Mutex<ManagerState>,
    bus: Mutex<BusState>,
    gate: CycleGate,
    registry: Arc<dyn FleetRegistry>,
    /// All declared registers, primary key device id, secondary key
    /// address. The batch planner requires exactly this order.
    sorted: Mutex<Vec<Arc<dyn RawRegister>>>,
}

struct CycleThread {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// The scheduling core. One per process and per bus.
pub struct Manager<R: FleetRegistry> {
    shared: Arc<ManagerShared>,
    registry: Arc<R>,
    cycle_thread: Mutex<Option<CycleThread>>,
}

impl<R: FleetRegistry> Manager<R> {
    pub fn new(registry: R) -> Self {
        let registry = Arc::new(registry);
        let erased: Arc<dyn FleetRegistry> = Arc::clone(&registry) as Arc<dyn FleetRegistry>;
        let shared = Arc::new(ManagerShared {
            state: Mutex::new(ManagerState::default()),
            bus: Mutex::new(BusState {
                protocol: None,
                factories: Vec::new(),
                bus_factory: None,
            }),
            gate: CycleGate::new(),
            registry: erased,
            sorted: Mutex::new(Vec::new()),
        });
        Self {
            shared,
            registry,
            cycle_thread: Mutex::new(None),
        }
    }

    fn hooks(&self) -> Weak<dyn CallManager> {
        let strong: Arc<dyn CallManager> = Arc::clone(&self.shared) as Arc<dyn CallManager>;
        Arc::downgrade(&strong)
    }

    /// The aggregate registry, for typed device access.
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Creates, attaches, and initializes a device of model `D`.
    pub fn add_device<D: DeviceModel>(
        &self,
        name: &str,
        id: DeviceId,
    ) -> Result<Arc<D>, FleetError>
    where
        R: TypedAccess<D>,
    {
        // Identity must be unique across every model, not just D's.
        if self.registry.exists_id(id) || self.registry.exists_name(name) {
            return Err(FleetError::DuplicateDevice {
                name: name.to_string(),
                id,
            });
        }
        self.registry.typed().add(name, id, self.hooks())
    }

    /// Typed device lookup by name.
    pub fn device<D: DeviceModel>(
        &self,
        name: &str,
    ) -> Result<Arc<D>, FleetError>
    where
        R: TypedAccess<D>,
    {
        self.registry
            .typed()
            .get(name)
            .ok_or_else(|| FleetError::UnknownDeviceName(name.to_string()))
    }

    /// Typed device lookup by id.
    pub fn device_by_id<D: DeviceModel>(
        &self,
        id: DeviceId,
    ) -> Result<Arc<D>, FleetError>
    where
        R: TypedAccess<D>,
    {
        self.registry
            .typed()
            .get_by_id(id)
            .ok_or(FleetError::UnknownDeviceId(id))
    }

    /// Type-erased device lookup by name.
    pub fn device_any(
        &self,
        name: &str,
    ) -> Result<Arc<dyn FleetDevice>, FleetError> {
        self.registry
            .device_by_name(name)
            .ok_or_else(|| FleetError::UnknownDeviceName(name.to_string()))
    }

    /// Type-erased device lookup by id.
    pub fn device_any_by_id(
        &self,
        id: DeviceId,
    ) -> Result<Arc<dyn FleetDevice>, FleetError> {
        self.registry
            .device_by_id(id)
            .ok_or(FleetError::UnknownDeviceId(id))
    }

    pub fn devices(&self) -> Vec<Arc<dyn FleetDevice>> {
        self.registry.devices()
    }

    pub fn device_exists(&self, name: &str) -> bool {
        self.registry.exists_name(name)
    }

    pub fn device_exists_id(&self, id: DeviceId) -> bool {
        self.registry.exists_id(id)
    }

    // Scheduling knobs.

    pub fn is_schedule_mode(&self) -> bool {
        self.shared.state().schedule_mode
    }

    /// Scheduled mode batches bus I/O into cycles; immediate mode performs
    /// every user register access synchronously.
    pub fn set_schedule_mode(&self, mode: bool) {
        self.shared.state().schedule_mode = mode;
    }

    pub fn set_enable_sync_read(&self, enable: bool) {
        self.shared.state().enable_sync_read = enable;
    }

    pub fn set_enable_sync_write(&self, enable: bool) {
        self.shared.state().enable_sync_write = enable;
    }

    /// Whether writes await (and check) the device's status response.
    pub fn set_wait_write_check_response(&self, enable: bool) {
        self.shared.state().wait_write_check = enable;
    }

    /// Whether an unsupported type found by `scan` fails the scan (true)
    /// or is logged and skipped (false).
    pub fn set_throw_on_scan(&self, enable: bool) {
        self.shared.state().throw_on_scan = enable;
    }

    /// Whether exhausted force-path retries fail the call (true) or are
    /// logged and swallowed (false).
    pub fn set_throw_on_read(&self, enable: bool) {
        self.shared.state().throw_on_read = enable;
    }

    // Bus and protocol configuration.

    /// Registers a protocol implementation for name-based construction.
    pub fn register_protocol_factory(
        &self,
        factory: Box<dyn ProtocolFactory>,
    ) {
        self.shared.bus().factories.push(factory);
    }

    /// Installs the transport constructor used by
    /// [`set_protocol`](Self::set_protocol) for non-empty ports.
    pub fn set_bus_factory(
        &self,
        factory: impl Fn(&str, u32) -> Result<Box<dyn Bus>, FleetError>
            + Send
            + 'static,
    ) {
        self.shared.bus().bus_factory = Some(Box::new(factory));
    }

    /// Builds a fresh bus and protocol pair, releasing the previous one.
    /// An empty port yields a [`NullBus`] (for protocols that need no
    /// transport).
    pub fn set_protocol(
        &self,
        port: &str,
        baudrate: u32,
        protocol: &str,
    ) -> Result<(), FleetError> {
        {
            let mut state = self.shared.state();
            state.port = port.to_string();
            state.baudrate = baudrate;
            state.protocol_name = protocol.to_string();
        }
        let mut bus = self.shared.bus();
        bus.protocol = None;

        let transport: Box<dyn Bus> = if port.is_empty() {
            Box::new(NullBus)
        } else {
            let factory = bus.bus_factory.as_ref().ok_or_else(|| {
                FleetError::BusOpen {
                    port: port.to_string(),
                    detail: "no bus factory installed".to_string(),
                }
            })?;
            factory(port, baudrate)?
        };

        let built = {
            let factory = bus
                .factories
                .iter()
                .find(|f| f.name() == protocol)
                .ok_or_else(|| {
                    FleetError::UnknownProtocol(protocol.to_string())
                })?;
            factory.build(transport)
        };
        bus.protocol = Some(built);
        Ok(())
    }

    /// Installs a protocol directly, bypassing the factory machinery.
    /// Intended for tests and embedders that construct their own stack.
    pub fn set_protocol_instance(&self, protocol: Box<dyn Protocol>) {
        self.shared.bus().protocol = Some(protocol);
    }

    /// Access to the live protocol's tunables (response timeout and
    /// friends).
    pub fn with_protocol_parameters<T>(
        &self,
        f: impl FnOnce(&mut ParameterList) -> T,
    ) -> Result<T, FleetError> {
        let mut bus = self.shared.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;
        Ok(f(proto.parameters_mut()))
    }

    // The cycle.

    /// Runs one cycle. No-op while schedule mode is off.
    pub fn flush(&self) -> Result<(), FleetError> {
        self.shared.flush()
    }

    /// Swaps any pending read data into user view immediately, outside the
    /// cycle.
    pub fn force_swap(&self) {
        self.shared.swap_all();
    }

    /// Blocks the calling user thread until the next cycle has published
    /// fresh data (phase 1) and made its selection decisions (phase 2).
    /// Returns immediately while schedule mode is off.
    pub fn wait_next_flush(&self) {
        if !self.is_schedule_mode() {
            return;
        }
        let report = self.shared.gate.wait_cycle();
        let mut state = self.shared.state();
        state.stats.wait_manager_duration += report.waited;
        if report.cooperative {
            state.stats.wait_next_flush_cooperative_count += 1;
        } else {
            state.stats.wait_next_flush_count += 1;
        }
    }

    /// Enrolls the calling thread as cooperative: cycles will not start
    /// until it is parked in [`wait_next_flush`](Self::wait_next_flush).
    pub fn enable_cooperative_thread(&self) -> Result<(), FleetError> {
        Ok(self.shared.gate.enroll()?)
    }

    pub fn disable_cooperative_thread(&self) -> Result<(), FleetError> {
        Ok(self.shared.gate.withdraw()?)
    }

    /// Spawns the cycle thread: one `flush()` per `period`. Any prior
    /// cycle thread is stopped first.
    pub fn spawn_cycle_thread(
        &self,
        period: Duration,
    ) -> Result<(), FleetError> {
        self.stop_cycle_thread();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("fleet-cycle".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if let Err(e) = shared.flush() {
                        log::error!("cycle thread stopping: {e}");
                        break;
                    }
                    thread::sleep(period);
                }
            })?;
        *self.lock_cycle_thread() = Some(CycleThread { stop, handle });
        Ok(())
    }

    /// Stops the cycle thread after its current iteration. Cooperative
    /// users must be parked in `wait_next_flush` (or withdrawn) for the
    /// final cycle to complete.
    pub fn stop_cycle_thread(&self) {
        if let Some(t) = self.lock_cycle_thread().take() {
            t.stop.store(true, Ordering::Relaxed);
            let _ = t.handle.join();
        }
    }

    fn lock_cycle_thread(&self) -> MutexGuard<'_, Option<CycleThread>> {
        self.cycle_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Probes and broadcast controls.

    /// Reachability probe; updates the device's presence if the id is
    /// known.
    pub fn ping(&self, id: DeviceId) -> Result<bool, FleetError> {
        self.shared.ping(id)
    }

    pub fn ping_by_name(&self, name: &str) -> Result<bool, FleetError> {
        let dev = self.device_any(name)?;
        self.shared.ping(dev.core().id())
    }

    /// Probes the whole id range, creating registry entries for newly
    /// discovered devices via their reported type number.
    pub fn scan(&self) -> Result<(), FleetError> {
        self.shared.scan(self.hooks())
    }

    /// Pings every known device, updating presence. True when all
    /// answered.
    pub fn check_devices(&self) -> Result<bool, FleetError> {
        self.shared.check_devices()
    }

    /// Runs `set_config` on every present device, pushing parameter-derived
    /// values onto hardware registers.
    pub fn set_devices_config(&self) -> Result<(), FleetError> {
        for dev in self.registry.devices() {
            if dev.core().is_present() {
                dev.set_config()?;
            }
        }
        Ok(())
    }

    /// Broadcasts the protocol's stop-all-actuation command.
    pub fn emergency_stop(&self) -> Result<(), FleetError> {
        self.shared.emergency(true)
    }

    /// Broadcasts the inverse of [`emergency_stop`](Self::emergency_stop).
    pub fn exit_emergency_state(&self) -> Result<(), FleetError> {
        self.shared.emergency(false)
    }

    /// Rewrites a device's id register on the wire. The in-memory registry
    /// is deliberately left alone; re-scan (or restart) afterwards.
    pub fn change_device_id(
        &self,
        old: DeviceId,
        new: DeviceId,
    ) -> Result<(), FleetError> {
        if !self.shared.ping(old)? {
            return Err(FleetError::DeviceNotResponding(old));
        }
        self.shared.change_device_id(old, new)
    }

    // Statistics.

    pub fn statistics(&self) -> Statistics {
        self.shared.state().stats.clone()
    }

    pub fn reset_statistics(&self) {
        self.shared.state().stats.reset();
    }

    // Persistence.

    /// The full persisted document: one key per supported device type plus
    /// the `Manager` section.
    pub fn save_json(&self) -> Value {
        let mut doc = match self.registry.save_json() {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        doc.insert(
            "Manager".to_string(),
            self.shared.state().to_params().save_json(),
        );
        Value::Object(doc)
    }

    /// Strict load of [`save_json`](Self::save_json)'s document shape.
    /// Missing devices are created; mismatched identities fail.
    pub fn load_json(&self, doc: &Value) -> Result<(), FleetError> {
        let obj = doc.as_object().ok_or_else(|| {
            FleetError::ConfigMalformed("document is not an object".into())
        })?;
        let hooks = self.hooks();
        for (key, value) in obj {
            if key == "Manager" {
                let mut state = self.shared.state();
                let mut params = state.to_params();
                params.load_json(value)?;
                state.apply_params(&params)?;
            } else {
                self.registry.load_type_json(key, value, &hooks)?;
            }
        }
        Ok(())
    }

    pub fn write_config(&self, path: &str) -> Result<(), FleetError> {
        let doc = self.save_json();
        std::fs::write(path, format!("{doc:#}\n"))?;
        Ok(())
    }

    pub fn read_config(&self, path: &str) -> Result<(), FleetError> {
        let text = std::fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&text)?;
        self.load_json(&doc)
    }
}

impl<R: FleetRegistry> Drop for Manager<R> {
    fn drop(&mut self) {
        self.stop_cycle_thread();
    }
}

impl ManagerShared {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bus(&self) -> MutexGuard<'_, BusState> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Response bookkeeping shared by every transaction path: statistics
    /// plus device health, returning whether the response is usable.
    fn check_response(
        &self,
        response: ResponseState,
        dev: Option<&Arc<dyn FleetDevice>>,
    ) -> bool {
        {
            let mut state = self.state();
            let stats = &mut state.stats;
            if response.is_quiet() {
                stats.device_quiet_count += 1;
            }
            if response.is_warning() {
                stats.device_warning_count += 1;
            }
            if response.is_error() {
                stats.device_error_count += 1;
            }
            if response.is_ok() {
                stats.device_ok_count += 1;
            }
        }
        if let Some(dev) = dev {
            dev.core().note_response(response);
        }
        response.is_ok()
    }

    fn swap_all(&self) {
        let regs = self
            .sorted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for reg in &regs {
            reg.swap_read();
        }
    }

    fn flush(&self) -> Result<(), FleetError> {
        if !self.state().schedule_mode {
            return Ok(());
        }

        let cycle_start = Instant::now();
        let (sync_read, sync_write, wait_check, cycle_count) = {
            let mut state = self.state();
            state.stats.note_flush_start(cycle_start);
            (
                state.enable_sync_read,
                state.enable_sync_write,
                state.wait_write_check,
                state.cycle_count,
            )
        };

        let guard = self.gate.begin_cycle().map_err(FleetError::from)?;

        // Phase 1 is open: publish the previous cycle's reads and let the
        // devices react.
        self.swap_all();
        let devices = self.registry.devices();
        for dev in &devices {
            dev.on_swap();
        }

        // Selection. Write selection re-encodes pending values into tx
        // buffers and closes their aggregation windows, so it must happen
        // here, between the barriers.
        let dont_read: std::collections::HashSet<DeviceId> = devices
            .iter()
            .filter(|d| d.core().dont_read())
            .map(|d| d.core().id())
            .collect();

        let sorted = self
            .sorted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut write_sel: Vec<Arc<dyn RawRegister>> = Vec::new();
        let mut write_items: Vec<PlanReg> = Vec::new();
        let mut read_sel: Vec<Arc<dyn RawRegister>> = Vec::new();
        let mut read_items: Vec<PlanReg> = Vec::new();

        for reg in &sorted {
            let Some(id) = reg.device_id() else { continue };
            let desc = reg.desc();

            if reg.need_write() {
                reg.select_for_write();
                write_items.push(PlanReg {
                    id,
                    addr: desc.addr(),
                    len: desc.len(),
                });
                write_sel.push(Arc::clone(reg));
            }

            let periodic = desc.period() > 0
                && cycle_count % u64::from(desc.period()) == 0;
            if !dont_read.contains(&id) && (reg.need_read() || periodic) {
                read_items.push(PlanReg {
                    id,
                    addr: desc.addr(),
                    len: desc.len(),
                });
                read_sel.push(Arc::clone(reg));
            }
        }

        let write_plan = batch::plan(&write_items, sync_write);
        let read_plan = batch::plan(&read_items, sync_read);

        guard.finish();
        self.state().stats.wait_users_duration += cycle_start.elapsed();

        // All writes precede all reads on the bus.
        let mut any_slow = false;
        for entry in &write_plan {
            self.write_batch(entry, &write_sel, wait_check)?;
            any_slow |= entry
                .regs
                .iter()
                .flatten()
                .any(|&i| write_sel[i].desc().is_slow());
        }
        if any_slow {
            thread::sleep(SLOW_REGISTER_DELAY);
        }
        for entry in &read_plan {
            self.read_batch(entry, &read_sel)?;
        }

        self.state().cycle_count += 1;
        Ok(())
    }

    /// Gathers one device's member tx windows into a transaction buffer.
    fn gather(
        entry: &BatchEntry,
        members: &[usize],
        selected: &[Arc<dyn RawRegister>],
    ) -> Vec<u8> {
        let mut window = vec![0u8; entry.len];
        for &index in members {
            let reg = &selected[index];
            let off = usize::from(reg.desc().addr() - entry.addr);
            let len = reg.desc().len();
            window[off..off + len]
                .copy_from_slice(&reg.tx_window()[..len]);
        }
        window
    }

    fn write_batch(
        &self,
        entry: &BatchEntry,
        selected: &[Arc<dyn RawRegister>],
        wait_check: bool,
    ) -> Result<(), FleetError> {
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;

        let total: u64 =
            entry.regs.iter().map(|m| m.len() as u64).sum();
        self.state().stats.reg_written_per_flush_accu += total;

        let windows: Vec<Vec<u8>> = entry
            .regs
            .iter()
            .map(|members| Self::gather(entry, members, selected))
            .collect();
        let devs: Vec<Option<Arc<dyn FleetDevice>>> = entry
            .ids
            .iter()
            .map(|&id| self.registry.device_by_id(id))
            .collect();

        if entry.ids.len() == 1 {
            let started = Instant::now();
            if wait_check {
                let response = proto.write_checked(
                    entry.ids[0],
                    entry.addr,
                    &windows[0],
                );
                if !self.check_response(response, devs[0].as_ref()) {
                    self.state().stats.write_error_count += 1;
                    for &index in &entry.regs[0] {
                        selected[index].write_error();
                    }
                }
            } else {
                proto.write(entry.ids[0], entry.addr, &windows[0]);
            }
            self.state()
                .stats
                .note_write(entry.len, started.elapsed());
        } else {
            let data: Vec<&[u8]> =
                windows.iter().map(Vec::as_slice).collect();
            let started = Instant::now();
            if wait_check {
                let responses =
                    proto.sync_write_checked(&entry.ids, entry.addr, &data);
                for (slot, response) in responses.into_iter().enumerate() {
                    if !self.check_response(response, devs[slot].as_ref()) {
                        self.state().stats.write_error_count += 1;
                        for &index in &entry.regs[slot] {
                            selected[index].write_error();
                        }
                    }
                }
            } else {
                proto.sync_write(&entry.ids, entry.addr, &data);
            }
            self.state()
                .stats
                .note_sync_write(entry.len, started.elapsed());
        }
        Ok(())
    }

    fn read_batch(
        &self,
        entry: &BatchEntry,
        selected: &[Arc<dyn RawRegister>],
    ) -> Result<(), FleetError> {
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;

        for members in &entry.regs {
            for &index in members {
                selected[index].ready_for_read();
            }
        }
        let total: u64 =
            entry.regs.iter().map(|m| m.len() as u64).sum();
        self.state().stats.reg_read_per_flush_accu += total;

        let devs: Vec<Option<Arc<dyn FleetDevice>>> = entry
            .ids
            .iter()
            .map(|&id| self.registry.device_by_id(id))
            .collect();

        let scatter = |members: &[usize], window: &[u8], ts: Instant| {
            for &index in members {
                let reg = &selected[index];
                let off = usize::from(reg.desc().addr() - entry.addr);
                let len = reg.desc().len();
                reg.finish_read(ts, &window[off..off + len]);
            }
        };

        if entry.ids.len() == 1 {
            let mut window = vec![0u8; entry.len];
            let started = Instant::now();
            let response = proto.read(entry.ids[0], entry.addr, &mut window);
            self.state().stats.note_read(entry.len, started.elapsed());

            if self.check_response(response, devs[0].as_ref()) {
                scatter(&entry.regs[0], &window, Instant::now());
            } else {
                self.state().stats.read_error_count += 1;
                for &index in &entry.regs[0] {
                    selected[index].read_error();
                }
            }
        } else {
            let mut windows: Vec<Vec<u8>> =
                entry.ids.iter().map(|_| vec![0u8; entry.len]).collect();
            let started = Instant::now();
            let responses = {
                let mut refs: Vec<&mut [u8]> =
                    windows.iter_mut().map(Vec::as_mut_slice).collect();
                proto.sync_read(&entry.ids, entry.addr, &mut refs)
            };
            self.state()
                .stats
                .note_sync_read(entry.len, started.elapsed());

            let ts = Instant::now();
            for (slot, response) in responses.into_iter().enumerate() {
                if self.check_response(response, devs[slot].as_ref()) {
                    scatter(&entry.regs[slot], &windows[slot], ts);
                } else {
                    self.state().stats.read_error_count += 1;
                    for &index in &entry.regs[slot] {
                        selected[index].read_error();
                    }
                }
            }
        }
        Ok(())
    }

    fn ping(&self, id: DeviceId) -> Result<bool, FleetError> {
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;
        let response = proto.ping(id);
        if let Some(dev) = self.registry.device_by_id(id) {
            dev.core().set_present(response);
        }
        Ok(response)
    }

    fn check_devices(&self) -> Result<bool, FleetError> {
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;
        let mut all_present = true;
        for dev in self.registry.devices() {
            let response = proto.ping(dev.core().id());
            dev.core().set_present(response);
            all_present &= response;
        }
        Ok(all_present)
    }

    fn scan(
        &self,
        hooks: Weak<dyn CallManager>,
    ) -> Result<(), FleetError> {
        let throw_on_scan = self.state().throw_on_scan;
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;

        for dev in self.registry.devices() {
            dev.core().set_present(false);
        }

        for raw in DEVICE_ID_MIN..=DEVICE_ID_MAX {
            let id = DeviceId(raw);
            if !proto.ping(id) {
                continue;
            }
            let mut buf = [0u8; 2];
            let response = proto.read(id, TYPE_NUMBER_ADDR, &mut buf);
            if !self.check_response(response, None) {
                continue;
            }
            let found = u16::from_le_bytes(buf);

            match self.registry.type_number_by_id(id) {
                Some(known) if known != found => {
                    let known_name = self
                        .registry
                        .device_by_id(id)
                        .map(|d| d.core().name().to_string())
                        .unwrap_or_default();
                    return Err(FleetError::ScanTypeMismatch {
                        id,
                        found,
                        known,
                        known_name,
                    });
                }
                Some(_) => {
                    if let Some(dev) = self.registry.device_by_id(id) {
                        dev.core().set_present(true);
                    }
                }
                None => {
                    let Some(type_name) = self.registry.type_name_of(found)
                    else {
                        if throw_on_scan {
                            return Err(FleetError::UnsupportedType(found));
                        }
                        log::warn!(
                            "scan: id {id} reports unsupported type {found}; \
                             skipping"
                        );
                        continue;
                    };
                    let name = format!("{type_name}_{raw}");
                    let dev = self.registry.create(
                        found,
                        &name,
                        id,
                        hooks.clone(),
                    )?;
                    dev.core().set_present(true);
                }
            }
        }
        Ok(())
    }

    fn emergency(&self, stop: bool) -> Result<(), FleetError> {
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;
        if stop {
            self.state().stats.emergency_count += 1;
            proto.emergency_stop();
        } else {
            self.state().stats.exit_emergency_count += 1;
            proto.exit_emergency_state();
        }
        Ok(())
    }

    fn change_device_id(
        &self,
        old: DeviceId,
        new: DeviceId,
    ) -> Result<(), FleetError> {
        let wait_check = self.state().wait_write_check;
        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;
        let data = [new.0];
        if wait_check {
            let response = proto.write_checked(old, ID_ADDR, &data);
            if !self.check_response(response, None) {
                self.state().stats.write_error_count += 1;
                log::warn!("failed changing device id {old} to {new}");
                return Err(FleetError::ForceWriteFailed {
                    id: old,
                    register: "id".to_string(),
                    state: response,
                });
            }
        } else {
            proto.write(old, ID_ADDR, &data);
        }
        log::info!(
            "changed device id {old} to {new}; re-scan before further use"
        );
        Ok(())
    }

    /// Single-register transaction with bounded retries; the force-read
    /// path behind force-read flags, immediate mode, and explicit
    /// `force_read` calls.
    fn force_read_impl(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError> {
        let dev = self
            .registry
            .device_by_id(id)
            .ok_or(FleetError::UnknownDeviceId(id))?;
        let reg = dev.core().registers().get(name).ok_or_else(|| {
            FleetError::UnknownRegister {
                device: id,
                name: name.to_string(),
            }
        })?;
        let throw_on_read = {
            let mut state = self.state();
            state.stats.force_read_count += 1;
            state.stats.reg_read_per_flush_accu += 1;
            state.throw_on_read
        };

        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;

        let len = reg.desc().len();
        let addr = reg.desc().addr();
        reg.ready_for_read();

        let mut failures = 0;
        loop {
            let mut window = [0u8; MAX_REG_LEN];
            let started = Instant::now();
            let response = proto.read(id, addr, &mut window[..len]);
            self.state().stats.note_read(len, started.elapsed());

            if self.check_response(response, Some(&dev)) {
                reg.finish_read(Instant::now(), &window[..len]);
                reg.swap_read();
                return Ok(());
            }

            reg.read_error();
            self.state().stats.read_error_count += 1;
            failures += 1;
            if failures >= MAX_FORCE_RETRIES {
                if throw_on_read {
                    return Err(FleetError::ForceReadFailed {
                        id,
                        register: name.to_string(),
                        state: response,
                    });
                }
                log::warn!(
                    "retries exhausted reading {name} on device {id}"
                );
                return Ok(());
            }
        }
    }

    /// The force-write path: select, transmit with bounded retries, settle
    /// if slow.
    fn force_write_impl(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError> {
        let dev = self
            .registry
            .device_by_id(id)
            .ok_or(FleetError::UnknownDeviceId(id))?;
        let reg = dev.core().registers().get(name).ok_or_else(|| {
            FleetError::UnknownRegister {
                device: id,
                name: name.to_string(),
            }
        })?;
        let (throw_on_read, wait_check) = {
            let mut state = self.state();
            state.stats.force_write_count += 1;
            state.stats.reg_written_per_flush_accu += 1;
            (state.throw_on_read, state.wait_write_check)
        };

        let mut bus = self.bus();
        let proto = bus
            .protocol
            .as_deref_mut()
            .ok_or(FleetError::ProtocolNotConfigured)?;

        let len = reg.desc().len();
        let addr = reg.desc().addr();
        reg.select_for_write();
        let window = reg.tx_window();

        let mut failures = 0;
        loop {
            let started = Instant::now();
            if wait_check {
                let response =
                    proto.write_checked(id, addr, &window[..len]);
                self.state().stats.note_write(len, started.elapsed());
                if self.check_response(response, Some(&dev)) {
                    break;
                }
                self.state().stats.write_error_count += 1;
                failures += 1;
                if failures >= MAX_FORCE_RETRIES {
                    reg.write_error();
                    if throw_on_read {
                        return Err(FleetError::ForceWriteFailed {
                            id,
                            register: name.to_string(),
                            state: response,
                        });
                    }
                    log::warn!(
                        "retries exhausted writing {name} on device {id}"
                    );
                    return Ok(());
                }
            } else {
                proto.write(id, addr, &window[..len]);
                self.state().stats.note_write(len, started.elapsed());
                break;
            }
        }

        if reg.desc().is_slow() {
            thread::sleep(SLOW_REGISTER_DELAY);
        }
        Ok(())
    }
}

impl CallManager for ManagerShared {
    fn is_schedule_mode(&self) -> bool {
        self.state().schedule_mode
    }

    fn force_register_read(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError> {
        self.force_read_impl(id, name)
    }

    fn force_register_write(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError> {
        self.force_write_impl(id, name)
    }

    fn on_new_register(&self, reg: Arc<dyn RawRegister>) {
        let mut sorted =
            self.sorted.lock().unwrap_or_else(PoisonError::into_inner);
        sorted.push(reg);
        sorted.sort_by_key(|r| {
            (r.device_id().map(|id| id.0).unwrap_or(0), r.desc().addr())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_params_round_trip() {
        let mut state = ManagerState::default();
        state.schedule_mode = false;
        state.baudrate = 57_600;
        state.protocol_name = "v1".to_string();
        state.throw_on_scan = false;

        let params = state.to_params();
        let doc = params.save_json();

        let mut other = ManagerState::default();
        let mut scratch = other.to_params();
        scratch.load_json(&doc).unwrap();
        other.apply_params(&scratch).unwrap();

        assert!(!other.schedule_mode);
        assert_eq!(other.baudrate, 57_600);
        assert_eq!(other.protocol_name, "v1");
        assert!(!other.throw_on_scan);
        assert!(other.enable_sync_read);
    }

    #[test]
    fn manager_params_reject_unknown_key() {
        let state = ManagerState::default();
        let mut params = state.to_params();
        let doc = serde_json::json!({ "sheduleMode": true });
        assert!(params.load_json(&doc).is_err());
    }
}
