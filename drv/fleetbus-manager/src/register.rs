// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed, double-buffered device registers.
//!
//! A register is one addressable field of one device. It carries two raw
//! byte buffers: `rx`, which the manager fills after a successful read, and
//! `tx`, which the manager drains when transmitting a write. Typed values
//! cross the byte boundary through a codec pair (`fn` pointers, chosen per
//! register by the device plug-in).
//!
//! The user-facing side is deliberately asynchronous: `write()` records a
//! pending value (folding repeated writes with the register's
//! [`Aggregation`] policy) and marks the register dirty; `read()` returns
//! the last value the manager swapped in, stamped with the time it came off
//! the bus. The manager side drives selection, transmission, and the swap
//! through the [`RawRegister`] object-safe face.
//!
//! Registers flagged force-read/force-write (and every register while the
//! manager is in immediate mode) short-circuit the schedule: the user call
//! triggers a synchronous, bounded-retry bus transaction through the
//! [`CallManager`] seam.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;

use drv_fleetbus_api::{DeviceId, ADDR_SPACE_LEN};

use crate::aggregation::{Aggregation, RegValue};
use crate::error::FleetError;
use crate::MAX_REG_LEN;

/// Standard codecs for the common wire encodings. Each function expects a
/// buffer slice exactly as long as the register window it serves.
pub mod codec {
    use byteorder::{ByteOrder, LittleEndian};

    pub fn encode_bool(buf: &mut [u8], v: bool) {
        buf[0] = u8::from(v);
    }
    pub fn decode_bool(buf: &[u8]) -> bool {
        buf[0] != 0
    }

    pub fn encode_u8(buf: &mut [u8], v: i64) {
        buf[0] = v as u8;
    }
    pub fn decode_u8(buf: &[u8]) -> i64 {
        i64::from(buf[0])
    }

    pub fn encode_u16_le(buf: &mut [u8], v: i64) {
        LittleEndian::write_u16(buf, v as u16);
    }
    pub fn decode_u16_le(buf: &[u8]) -> i64 {
        i64::from(LittleEndian::read_u16(buf))
    }

    pub fn encode_u24_le(buf: &mut [u8], v: i64) {
        LittleEndian::write_u24(buf, v as u32);
    }
    pub fn decode_u24_le(buf: &[u8]) -> i64 {
        i64::from(LittleEndian::read_u24(buf))
    }

    pub fn encode_u32_le(buf: &mut [u8], v: i64) {
        LittleEndian::write_u32(buf, v as u32);
    }
    pub fn decode_u32_le(buf: &[u8]) -> i64 {
        i64::from(LittleEndian::read_u32(buf))
    }

    pub fn encode_f32_le(buf: &mut [u8], v: f32) {
        LittleEndian::write_f32(buf, v);
    }
    pub fn decode_f32_le(buf: &[u8]) -> f32 {
        LittleEndian::read_f32(buf)
    }
}

/// Immutable configuration of one register.
#[derive(Clone, Debug)]
pub struct RegisterDesc {
    name: String,
    addr: u8,
    len: usize,
    /// Read period in cycles: 0 = never read periodically, 1 = every
    /// cycle, n = every n-th cycle.
    period: u32,
    force_read: bool,
    force_write: bool,
    slow: bool,
    read_only: bool,
}

impl RegisterDesc {
    /// Validates the window: `len <= MAX_REG_LEN` and
    /// `addr + len <= ADDR_SPACE_LEN`.
    pub fn new(name: &str, addr: u8, len: usize) -> Result<Self, FleetError> {
        if len == 0 || len > MAX_REG_LEN {
            return Err(FleetError::RegisterTooLong {
                name: name.to_string(),
                len,
            });
        }
        if usize::from(addr) + len > ADDR_SPACE_LEN {
            return Err(FleetError::RegisterOutOfRange {
                name: name.to_string(),
                addr,
                len,
            });
        }
        Ok(Self {
            name: name.to_string(),
            addr,
            len,
            period: 0,
            force_read: false,
            force_write: false,
            slow: false,
            read_only: false,
        })
    }

    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }
    pub fn force_read(mut self) -> Self {
        self.force_read = true;
        self
    }
    pub fn force_write(mut self) -> Self {
        self.force_write = true;
        self
    }
    /// Writes to this register need the post-write settle delay (EEPROM
    /// backed).
    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn addr(&self) -> u8 {
        self.addr
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn period(&self) -> u32 {
        self.period
    }
    pub fn is_force_read(&self) -> bool {
        self.force_read
    }
    pub fn is_force_write(&self) -> bool {
        self.force_write
    }
    pub fn is_slow(&self) -> bool {
        self.slow
    }
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// A value together with the instant it came off the bus.
///
/// `is_error` is true until the first successful read, and again whenever
/// the most recent read attempt failed (the value then is the last good
/// one).
#[derive(Copy, Clone, Debug)]
pub struct TimedValue<T> {
    pub timestamp: Instant,
    pub value: T,
    pub is_error: bool,
}

/// The manager seam registers call back into.
///
/// This indirection exists so registers (owned by devices, owned by the
/// registry) can route force-path I/O to the manager without a reference
/// cycle: registers hold a `Weak<dyn CallManager>`.
pub trait CallManager: Send + Sync {
    /// Whether the manager schedules bus I/O in cycles (true) or performs
    /// every user access immediately (false).
    fn is_schedule_mode(&self) -> bool;

    /// Synchronous bounded-retry read of one register.
    fn force_register_read(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError>;

    /// Synchronous bounded-retry write of one register.
    fn force_register_write(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<(), FleetError>;

    /// Invoked once per register as devices declare them; the manager
    /// maintains its (device id, address)-sorted view from these.
    fn on_new_register(&self, reg: Arc<dyn RawRegister>);
}

struct RegLink {
    id: DeviceId,
    manager: Weak<dyn CallManager>,
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct RegState<T> {
    rx: [u8; MAX_REG_LEN],
    tx: [u8; MAX_REG_LEN],
    value_read: T,
    value_write: T,
    policy: Aggregation,
    need_read: bool,
    need_write: bool,
    need_swap: bool,
    last_error: bool,
    ts_read_user: Instant,
    ts_read_manager: Instant,
    ts_user_write: Instant,
    on_read: Option<Callback<T>>,
    on_write: Option<Callback<T>>,
    min: Option<T>,
    max: Option<T>,
    step: Option<T>,
}

/// One typed register. Devices construct these (wrapped in `Arc`) as fields
/// and declare them to their [`RegisterSet`](crate::RegisterSet) during
/// init; user threads then share the `Arc`s freely.
pub struct TypedRegister<T: RegValue> {
    desc: RegisterDesc,
    encode: Option<fn(&mut [u8], T)>,
    decode: fn(&[u8]) -> T,
    link: OnceLock<RegLink>,
    state: Mutex<RegState<T>>,
}

impl<T: RegValue + Default> TypedRegister<T> {
    /// A writable register with the given codec pair.
    pub fn new(
        desc: RegisterDesc,
        encode: fn(&mut [u8], T),
        decode: fn(&[u8]) -> T,
    ) -> Arc<Self> {
        Self::build(desc, Some(encode), decode)
    }

    /// A read-only register; writes are rejected with
    /// [`FleetError::ReadOnlyWrite`].
    pub fn read_only(
        mut desc: RegisterDesc,
        decode: fn(&[u8]) -> T,
    ) -> Arc<Self> {
        desc.read_only = true;
        Self::build(desc, None, decode)
    }

    fn build(
        desc: RegisterDesc,
        encode: Option<fn(&mut [u8], T)>,
        decode: fn(&[u8]) -> T,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            desc,
            encode,
            decode,
            link: OnceLock::new(),
            state: Mutex::new(RegState {
                rx: [0; MAX_REG_LEN],
                tx: [0; MAX_REG_LEN],
                value_read: T::default(),
                value_write: T::default(),
                policy: Aggregation::Last,
                need_read: false,
                need_write: false,
                need_swap: false,
                // No successful read has happened yet.
                last_error: true,
                ts_read_user: now,
                ts_read_manager: now,
                ts_user_write: now,
                on_read: None,
                on_write: None,
                min: None,
                max: None,
                step: None,
            }),
        })
    }
}

impl<T: RegValue> TypedRegister<T> {
    pub fn desc(&self) -> &RegisterDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        self.desc.name()
    }

    fn lock(&self) -> MutexGuard<'_, RegState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches the register to its device and manager. Called by
    /// `RegisterSet::add` exactly once.
    pub(crate) fn bind(&self, id: DeviceId, manager: Weak<dyn CallManager>) {
        let _ = self.link.set(RegLink { id, manager });
    }

    fn manager(&self) -> Result<(DeviceId, Arc<dyn CallManager>), FleetError> {
        let link = self
            .link
            .get()
            .ok_or_else(|| FleetError::NotAttached(self.desc.name.clone()))?;
        let manager = link.manager.upgrade().ok_or_else(|| {
            FleetError::NotAttached(self.desc.name.clone())
        })?;
        Ok((link.id, manager))
    }

    /// Whether an attached manager is in immediate (non-scheduled) mode.
    /// An unattached register behaves as scheduled: values accumulate
    /// locally.
    fn immediate_mode(&self) -> bool {
        match self.link.get().and_then(|l| l.manager.upgrade()) {
            Some(m) => !m.is_schedule_mode(),
            None => false,
        }
    }

    /// Marks the register to be read on the next cycle.
    pub fn ask_read(&self) {
        self.lock().need_read = true;
    }

    /// Re-marks the register for transmission without touching the pending
    /// value.
    pub fn ask_write(&self) -> Result<(), FleetError> {
        if self.desc.read_only {
            return Err(FleetError::ReadOnlyWrite(self.desc.name.clone()));
        }
        self.lock().need_write = true;
        Ok(())
    }

    /// Records `value` for transmission. If a write is already pending, the
    /// two are folded with the register's aggregation policy. Fires the
    /// write callback, then — for force-write registers or in immediate
    /// mode — performs the bus write synchronously.
    pub fn write(&self, value: T) -> Result<(), FleetError> {
        self.write_impl(value, false)
    }

    /// Like [`write`](Self::write) but does not fire the write callback.
    pub fn write_silent(&self, value: T) -> Result<(), FleetError> {
        self.write_impl(value, true)
    }

    fn write_impl(&self, value: T, silent: bool) -> Result<(), FleetError> {
        if self.desc.read_only {
            return Err(FleetError::ReadOnlyWrite(self.desc.name.clone()));
        }

        let callback = {
            let mut state = self.lock();
            state.value_write = if state.need_write {
                T::aggregate(state.policy, state.value_write, value)
            } else {
                value
            };
            state.ts_user_write = Instant::now();
            state.need_write = true;
            if silent {
                None
            } else {
                state.on_write.clone()
            }
        };
        // The register mutex must not be held across the callback or any
        // bus I/O.
        if let Some(cb) = callback {
            cb(value);
        }

        if self.desc.force_write || self.immediate_mode() {
            let (id, manager) = self.manager()?;
            manager.force_register_write(id, &self.desc.name)?;
        }
        Ok(())
    }

    /// Returns the last value received from the hardware, its bus
    /// timestamp, and the error flag. Force-read registers (and immediate
    /// mode) hit the bus first.
    pub fn read(&self) -> Result<TimedValue<T>, FleetError> {
        if self.desc.force_read || self.immediate_mode() {
            let (id, manager) = self.manager()?;
            manager.force_register_read(id, &self.desc.name)?;
        }
        let state = self.lock();
        Ok(TimedValue {
            timestamp: state.ts_read_user,
            value: state.value_read,
            is_error: state.last_error,
        })
    }

    /// Immediate bounded-retry read, regardless of flags and mode.
    pub fn force_read(&self) -> Result<TimedValue<T>, FleetError> {
        let (id, manager) = self.manager()?;
        manager.force_register_read(id, &self.desc.name)?;
        let state = self.lock();
        Ok(TimedValue {
            timestamp: state.ts_read_user,
            value: state.value_read,
            is_error: state.last_error,
        })
    }

    /// Immediate bounded-retry transmission of the pending value.
    pub fn force_write(&self) -> Result<(), FleetError> {
        let (id, manager) = self.manager()?;
        manager.force_register_write(id, &self.desc.name)
    }

    /// The aggregated value pending transmission.
    pub fn written_value(&self) -> T {
        self.lock().value_write
    }

    /// The pending value as the hardware will see it: encoded, then decoded
    /// back, i.e. after codec quantization.
    pub fn written_value_after_encode(&self) -> Result<T, FleetError> {
        let encode = self
            .encode
            .ok_or_else(|| FleetError::ReadOnlyWrite(self.desc.name.clone()))?;
        let state = self.lock();
        let mut buf = [0u8; MAX_REG_LEN];
        encode(&mut buf[..self.desc.len], state.value_write);
        Ok((self.decode)(&buf[..self.desc.len]))
    }

    /// Timestamp of the most recent user write.
    pub fn last_write_time(&self) -> Instant {
        self.lock().ts_user_write
    }

    pub fn set_aggregation(&self, policy: Aggregation) {
        self.lock().policy = policy;
    }

    pub fn aggregation(&self) -> Aggregation {
        self.lock().policy
    }

    /// Callback fired with the decoded value after every successful swap.
    pub fn set_on_read(&self, f: impl Fn(T) + Send + Sync + 'static) {
        self.lock().on_read = Some(Arc::new(f));
    }

    /// Callback fired with the written value on every non-silent user
    /// write.
    pub fn set_on_write(&self, f: impl Fn(T) + Send + Sync + 'static) {
        self.lock().on_write = Some(Arc::new(f));
    }

    // Range and step hints, used by UIs. Unset by default.
    pub fn set_min_value(&self, v: T) {
        self.lock().min = Some(v);
    }
    pub fn set_max_value(&self, v: T) {
        self.lock().max = Some(v);
    }
    pub fn set_step_value(&self, v: T) {
        self.lock().step = Some(v);
    }
    pub fn min_value(&self) -> Option<T> {
        self.lock().min
    }
    pub fn max_value(&self) -> Option<T> {
        self.lock().max
    }
    pub fn step_value(&self) -> Option<T> {
        self.lock().step
    }
}

/// Object-safe face the manager drives. Everything here is manager-side
/// protocol; user code sticks to the typed API.
pub trait RawRegister: Send + Sync {
    fn desc(&self) -> &RegisterDesc;

    /// Device id, present once the register is declared to a device.
    fn device_id(&self) -> Option<DeviceId>;

    /// Dirty-read flag (the periodic term is the manager's business).
    fn need_read(&self) -> bool;

    /// Dirty-write flag.
    fn need_write(&self) -> bool;

    /// Selection for transmission: encodes the pending typed value into the
    /// tx buffer and clears the dirty-write flag. Aggregation restarts with
    /// the next write.
    fn select_for_write(&self);

    /// Marks the read as in flight: clears the dirty-read flag.
    fn ready_for_read(&self);

    /// Delivers freshly read bytes and the bus timestamp; the value becomes
    /// user-visible at the next swap.
    fn finish_read(&self, timestamp: Instant, window: &[u8]);

    /// A read attempt failed: re-mark dirty so it is retried next cycle.
    fn read_error(&self);

    /// A write attempt failed: re-mark dirty so it is retransmitted next
    /// cycle.
    fn write_error(&self);

    /// If new bytes are waiting, decode them into the user-visible value,
    /// publish the manager timestamp, clear the error flag, and fire the
    /// read callback.
    fn swap_read(&self);

    /// Snapshot of the tx buffer for transaction assembly.
    fn tx_window(&self) -> [u8; MAX_REG_LEN];
}

impl<T: RegValue> RawRegister for TypedRegister<T> {
    fn desc(&self) -> &RegisterDesc {
        &self.desc
    }

    fn device_id(&self) -> Option<DeviceId> {
        self.link.get().map(|l| l.id)
    }

    fn need_read(&self) -> bool {
        self.lock().need_read
    }

    fn need_write(&self) -> bool {
        self.lock().need_write
    }

    fn select_for_write(&self) {
        let mut state = self.lock();
        if let Some(encode) = self.encode {
            let len = self.desc.len;
            let value = state.value_write;
            encode(&mut state.tx[..len], value);
        }
        state.need_write = false;
    }

    fn ready_for_read(&self) {
        self.lock().need_read = false;
    }

    fn finish_read(&self, timestamp: Instant, window: &[u8]) {
        let mut state = self.lock();
        let len = self.desc.len.min(window.len());
        state.rx[..len].copy_from_slice(&window[..len]);
        state.ts_read_manager = timestamp;
        state.need_swap = true;
    }

    fn read_error(&self) {
        let mut state = self.lock();
        state.last_error = true;
        state.need_read = true;
    }

    fn write_error(&self) {
        self.lock().need_write = true;
    }

    fn swap_read(&self) {
        let (callback, value) = {
            let mut state = self.lock();
            if !state.need_swap {
                return;
            }
            state.need_swap = false;
            state.last_error = false;
            let value = (self.decode)(&state.rx[..self.desc.len]);
            state.value_read = value;
            state.ts_read_user = state.ts_read_manager;
            (state.on_read.clone(), value)
        };
        if let Some(cb) = callback {
            cb(value);
        }
    }

    fn tx_window(&self) -> [u8; MAX_REG_LEN] {
        self.lock().tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn desc(name: &str, addr: u8, len: usize) -> RegisterDesc {
        RegisterDesc::new(name, addr, len).unwrap()
    }

    #[test]
    fn window_validation() {
        assert!(matches!(
            RegisterDesc::new("big", 0, 5),
            Err(FleetError::RegisterTooLong { .. })
        ));
        assert!(matches!(
            RegisterDesc::new("far", 0xfd, 4),
            Err(FleetError::RegisterOutOfRange { .. })
        ));
        assert!(RegisterDesc::new("edge", 0xfb, 4).is_ok());
    }

    #[test]
    fn read_before_first_swap_reports_error() {
        let reg = TypedRegister::new(
            desc("position", 0x24, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        let v = reg.read().unwrap();
        assert!(v.is_error);
        assert_eq!(v.value, 0);
    }

    #[test]
    fn finish_then_swap_publishes_value_and_timestamp() {
        let reg = TypedRegister::new(
            desc("position", 0x24, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        let ts = Instant::now() + Duration::from_millis(5);
        reg.finish_read(ts, &[0x34, 0x12]);

        // Not visible until the swap.
        assert!(reg.read().unwrap().is_error);

        reg.swap_read();
        let v = reg.read().unwrap();
        assert!(!v.is_error);
        assert_eq!(v.value, 0x1234);
        assert_eq!(v.timestamp, ts);

        // Swapping again without new data changes nothing.
        reg.swap_read();
        assert_eq!(reg.read().unwrap().timestamp, ts);
    }

    #[test]
    fn aggregation_folds_between_selections() {
        let reg = TypedRegister::new(
            desc("accu", 0x10, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        reg.set_aggregation(Aggregation::Sum);
        reg.write(3).unwrap();
        reg.write(4).unwrap();
        reg.write(5).unwrap();
        assert_eq!(reg.written_value(), 12);
        assert!(reg.need_write());

        reg.select_for_write();
        assert!(!reg.need_write());
        assert_eq!(reg.tx_window()[..2], [12, 0]);

        // Selection ended the aggregation window; the next write starts
        // fresh.
        reg.write(7).unwrap();
        assert_eq!(reg.written_value(), 7);
    }

    #[test]
    fn last_policy_keeps_final_value() {
        let reg = TypedRegister::new(
            desc("goal", 0x1e, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        reg.write(10).unwrap();
        reg.write(20).unwrap();
        reg.write(30).unwrap();
        reg.select_for_write();
        assert_eq!(reg.tx_window()[..2], [30, 0]);
    }

    #[test]
    fn read_only_rejects_writes_without_mutation() {
        let reg: Arc<TypedRegister<i64>> = TypedRegister::read_only(
            desc("model", 0x00, 2),
            codec::decode_u16_le,
        );
        assert!(matches!(
            reg.write(1),
            Err(FleetError::ReadOnlyWrite(_))
        ));
        assert!(matches!(
            reg.ask_write(),
            Err(FleetError::ReadOnlyWrite(_))
        ));
        assert!(!reg.need_write());
        assert_eq!(reg.tx_window(), [0; MAX_REG_LEN]);
    }

    #[test]
    fn write_error_restores_dirty_flag() {
        let reg = TypedRegister::new(
            desc("goal", 0x1e, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        reg.write(10).unwrap();
        reg.select_for_write();
        assert!(!reg.need_write());
        reg.write_error();
        assert!(reg.need_write());
    }

    #[test]
    fn read_error_marks_error_and_retries() {
        let reg = TypedRegister::new(
            desc("position", 0x24, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        reg.finish_read(Instant::now(), &[1, 0]);
        reg.swap_read();
        assert!(!reg.read().unwrap().is_error);

        reg.ask_read();
        reg.ready_for_read();
        reg.read_error();
        let v = reg.read().unwrap();
        // Last good value is still served, but flagged.
        assert_eq!(v.value, 1);
        assert!(v.is_error);
        assert!(reg.need_read());
    }

    #[test]
    fn callbacks_fire_on_write_and_swap() {
        let reg = TypedRegister::new(
            desc("goal", 0x1e, 2),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        let writes = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicUsize::new(0));
        {
            let writes = Arc::clone(&writes);
            reg.set_on_write(move |_| {
                writes.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let reads = Arc::clone(&reads);
            reg.set_on_read(move |v| {
                assert_eq!(v, 5);
                reads.fetch_add(1, Ordering::SeqCst);
            });
        }

        reg.write(9).unwrap();
        reg.write_silent(9).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        reg.finish_read(Instant::now(), &[5, 0]);
        reg.swap_read();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn written_value_after_encode_quantizes() {
        // A codec that drops the low bit on encode.
        fn encode_even(buf: &mut [u8], v: i64) {
            buf[0] = (v as u8) & !1;
        }
        let reg = TypedRegister::new(
            desc("coarse", 0x08, 1),
            encode_even,
            codec::decode_u8,
        );
        reg.write(7).unwrap();
        assert_eq!(reg.written_value(), 7);
        assert_eq!(reg.written_value_after_encode().unwrap(), 6);
    }

    #[test]
    fn force_flag_without_manager_is_structural() {
        let reg = TypedRegister::new(
            desc("goal", 0x1e, 2).force_write(),
            codec::encode_u16_le,
            codec::decode_u16_le,
        );
        assert!(matches!(
            reg.write(1),
            Err(FleetError::NotAttached(_))
        ));
    }
}
