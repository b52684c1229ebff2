// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory bus and protocol mocks.
//!
//! [`MockProtocol`] emulates a fleet of devices as per-id register images:
//! reads serve bytes from the image, writes store into it, ping answers for
//! ids marked present. Tests script failures by queueing response states
//! per device, and assert transaction shapes (what the batch planner
//! emitted) through the call journal.
//!
//! [`MockBus`] is a byte-level loopback for framing tests: everything sent
//! is captured, and the test scripts the bytes the next read will return.
//!
//! Both hand out a separate handle sharing the underlying state, since the
//! manager (or protocol) takes ownership of the mock itself.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use drv_fleetbus_api::{
    Bus, DeviceId, ParameterList, Protocol, ProtocolFactory, ResponseState,
    ADDR_SPACE_LEN,
};

/// One protocol call as the mock observed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    Ping(DeviceId),
    Read {
        id: DeviceId,
        addr: u8,
        len: usize,
    },
    Write {
        id: DeviceId,
        addr: u8,
        len: usize,
        checked: bool,
    },
    SyncRead {
        ids: Vec<DeviceId>,
        addr: u8,
        len: usize,
    },
    SyncWrite {
        ids: Vec<DeviceId>,
        addr: u8,
        len: usize,
        checked: bool,
    },
    EmergencyStop,
    ExitEmergencyState,
}

struct FakeDevice {
    memory: [u8; ADDR_SPACE_LEN],
    present: bool,
    /// Scripted outcomes, consumed one per addressed exchange.
    scripted: VecDeque<ResponseState>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            memory: [0; ADDR_SPACE_LEN],
            present: false,
            scripted: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct MockInner {
    devices: HashMap<DeviceId, FakeDevice>,
    journal: Vec<Call>,
}

impl MockInner {
    fn outcome(&mut self, id: DeviceId) -> ResponseState {
        match self.devices.get_mut(&id) {
            None => ResponseState::QUIET,
            Some(dev) => {
                if let Some(scripted) = dev.scripted.pop_front() {
                    scripted
                } else if dev.present {
                    ResponseState::OK
                } else {
                    ResponseState::QUIET
                }
            }
        }
    }

    fn read_window(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &mut [u8],
    ) -> ResponseState {
        let state = self.outcome(id);
        if state.is_ok() {
            if let Some(dev) = self.devices.get(&id) {
                let start = usize::from(addr);
                data.copy_from_slice(&dev.memory[start..start + data.len()]);
            }
        }
        state
    }

    fn write_window(&mut self, id: DeviceId, addr: u8, data: &[u8]) {
        if let Some(dev) = self.devices.get_mut(&id) {
            let start = usize::from(addr);
            dev.memory[start..start + data.len()].copy_from_slice(data);
        }
    }
}

/// Test-side handle onto a [`MockProtocol`]'s device fleet.
#[derive(Clone)]
pub struct MockHandle {
    inner: Arc<Mutex<MockInner>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a responding device whose model register reads back
    /// `type_number`.
    pub fn add_device(&self, id: DeviceId, type_number: u16) {
        let mut inner = self.lock();
        let dev = inner.devices.entry(id).or_default();
        dev.present = true;
        dev.memory[0..2].copy_from_slice(&type_number.to_le_bytes());
    }

    /// Marks a device present or absent (absent devices answer `QUIET`).
    pub fn set_present(&self, id: DeviceId, present: bool) {
        if let Some(dev) = self.lock().devices.get_mut(&id) {
            dev.present = present;
        }
    }

    /// Stores bytes directly into a device's register image, as if the
    /// hardware had updated a sensor value.
    pub fn poke(&self, id: DeviceId, addr: u8, data: &[u8]) {
        self.lock().write_window(id, addr, data);
    }

    /// Reads bytes back out of a device's register image.
    pub fn peek(&self, id: DeviceId, addr: u8, len: usize) -> Vec<u8> {
        let inner = self.lock();
        match inner.devices.get(&id) {
            Some(dev) => {
                let start = usize::from(addr);
                dev.memory[start..start + len].to_vec()
            }
            None => vec![0; len],
        }
    }

    /// Scripts the outcome of the device's next addressed exchange.
    pub fn fail_next(&self, id: DeviceId, state: ResponseState) {
        if let Some(dev) = self.lock().devices.get_mut(&id) {
            dev.scripted.push_back(state);
        }
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

/// Protocol emulation over the in-memory fleet.
pub struct MockProtocol {
    inner: Arc<Mutex<MockInner>>,
    params: ParameterList,
}

impl MockProtocol {
    pub fn new() -> (Self, MockHandle) {
        let inner = Arc::new(Mutex::new(MockInner::default()));
        let mut params = ParameterList::new();
        let _ = params.add_number("timeout", 0.005);
        (
            Self {
                inner: Arc::clone(&inner),
                params,
            },
            MockHandle { inner },
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Protocol for MockProtocol {
    fn ping(&mut self, id: DeviceId) -> bool {
        let mut inner = self.lock();
        inner.journal.push(Call::Ping(id));
        inner.devices.get(&id).is_some_and(|d| d.present)
    }

    fn read(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &mut [u8],
    ) -> ResponseState {
        let mut inner = self.lock();
        inner.journal.push(Call::Read {
            id,
            addr,
            len: data.len(),
        });
        inner.read_window(id, addr, data)
    }

    fn write(&mut self, id: DeviceId, addr: u8, data: &[u8]) {
        let mut inner = self.lock();
        inner.journal.push(Call::Write {
            id,
            addr,
            len: data.len(),
            checked: false,
        });
        inner.write_window(id, addr, data);
    }

    fn write_checked(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &[u8],
    ) -> ResponseState {
        let mut inner = self.lock();
        inner.journal.push(Call::Write {
            id,
            addr,
            len: data.len(),
            checked: true,
        });
        let state = inner.outcome(id);
        if state.is_ok() {
            inner.write_window(id, addr, data);
        }
        state
    }

    fn sync_read(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &mut [&mut [u8]],
    ) -> Vec<ResponseState> {
        let mut inner = self.lock();
        inner.journal.push(Call::SyncRead {
            ids: ids.to_vec(),
            addr,
            len: data.first().map_or(0, |d| d.len()),
        });
        ids.iter()
            .zip(data.iter_mut())
            .map(|(&id, window)| inner.read_window(id, addr, window))
            .collect()
    }

    fn sync_write(&mut self, ids: &[DeviceId], addr: u8, data: &[&[u8]]) {
        let mut inner = self.lock();
        inner.journal.push(Call::SyncWrite {
            ids: ids.to_vec(),
            addr,
            len: data.first().map_or(0, |d| d.len()),
            checked: false,
        });
        for (&id, window) in ids.iter().zip(data) {
            inner.write_window(id, addr, window);
        }
    }

    fn sync_write_checked(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &[&[u8]],
    ) -> Vec<ResponseState> {
        let mut inner = self.lock();
        inner.journal.push(Call::SyncWrite {
            ids: ids.to_vec(),
            addr,
            len: data.first().map_or(0, |d| d.len()),
            checked: true,
        });
        ids.iter()
            .zip(data)
            .map(|(&id, window)| {
                let state = inner.outcome(id);
                if state.is_ok() {
                    inner.write_window(id, addr, window);
                }
                state
            })
            .collect()
    }

    fn emergency_stop(&mut self) {
        self.lock().journal.push(Call::EmergencyStop);
    }

    fn exit_emergency_state(&mut self) {
        self.lock().journal.push(Call::ExitEmergencyState);
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterList {
        &mut self.params
    }
}

/// Factory registering the mock under the name `mock`. The shared handle
/// is fixed at factory construction, so every protocol built by it serves
/// the same fleet.
pub struct MockProtocolFactory {
    inner: Arc<Mutex<MockInner>>,
}

impl MockProtocolFactory {
    pub fn new() -> (Self, MockHandle) {
        let inner = Arc::new(Mutex::new(MockInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockHandle { inner },
        )
    }
}

impl ProtocolFactory for MockProtocolFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn build(&self, _bus: Box<dyn Bus>) -> Box<dyn Protocol> {
        let mut params = ParameterList::new();
        let _ = params.add_number("timeout", 0.005);
        Box::new(MockProtocol {
            inner: Arc::clone(&self.inner),
            params,
        })
    }
}

struct MockBusInner {
    sent: Vec<u8>,
    pending: VecDeque<u8>,
}

/// Test-side handle onto a [`MockBus`].
#[derive(Clone)]
pub struct MockBusHandle {
    inner: Arc<Mutex<MockBusInner>>,
}

impl MockBusHandle {
    fn lock(&self) -> MutexGuard<'_, MockBusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything the protocol has sent so far.
    pub fn sent(&self) -> Vec<u8> {
        self.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Scripts bytes for the protocol's next reads.
    pub fn push_response(&self, data: &[u8]) {
        self.lock().pending.extend(data);
    }
}

/// Byte-level loopback transport for framing tests.
pub struct MockBus {
    inner: Arc<Mutex<MockBusInner>>,
}

impl MockBus {
    pub fn new() -> (Self, MockBusHandle) {
        let inner = Arc::new(Mutex::new(MockBusInner {
            sent: Vec::new(),
            pending: VecDeque::new(),
        }));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockBusHandle { inner },
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockBusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Bus for MockBus {
    fn send(&mut self, data: &[u8]) -> bool {
        self.lock().sent.extend_from_slice(data);
        true
    }

    fn wait_readable(&mut self, _timeout: Duration) -> bool {
        !self.lock().pending.is_empty()
    }

    fn available(&mut self) -> usize {
        self.lock().pending.len()
    }

    fn read(&mut self, data: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let mut count = 0;
        while count < data.len() {
            match inner.pending.pop_front() {
                Some(byte) => {
                    data[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn flush(&mut self) {}

    fn clear_input(&mut self) {
        self.lock().pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_serves_device_memory() {
        let (mut proto, handle) = MockProtocol::new();
        handle.add_device(DeviceId(5), 0x0140);
        handle.poke(DeviceId(5), 0x24, &[0x34, 0x12]);

        let mut buf = [0u8; 2];
        let state = proto.read(DeviceId(5), 0x24, &mut buf);
        assert!(state.is_ok());
        assert_eq!(buf, [0x34, 0x12]);

        // The model register was set by add_device.
        let mut model = [0u8; 2];
        assert!(proto.read(DeviceId(5), 0x00, &mut model).is_ok());
        assert_eq!(u16::from_le_bytes(model), 0x0140);
    }

    #[test]
    fn unknown_ids_are_quiet() {
        let (mut proto, _handle) = MockProtocol::new();
        assert!(!proto.ping(DeviceId(9)));
        let mut buf = [0u8; 1];
        assert!(proto.read(DeviceId(9), 0, &mut buf).is_quiet());
    }

    #[test]
    fn scripted_failures_consume_in_order() {
        let (mut proto, handle) = MockProtocol::new();
        handle.add_device(DeviceId(3), 1);
        handle.fail_next(DeviceId(3), ResponseState::BAD_CHECKSUM);

        let mut buf = [0u8; 1];
        assert!(proto.read(DeviceId(3), 0x10, &mut buf).is_error());
        assert!(proto.read(DeviceId(3), 0x10, &mut buf).is_ok());
    }

    #[test]
    fn checked_write_respects_script() {
        let (mut proto, handle) = MockProtocol::new();
        handle.add_device(DeviceId(3), 1);
        handle.poke(DeviceId(3), 0x1e, &[7]);
        handle.fail_next(DeviceId(3), ResponseState::QUIET);

        // Failed write must not mutate the image.
        assert!(proto.write_checked(DeviceId(3), 0x1e, &[9]).is_quiet());
        assert_eq!(handle.peek(DeviceId(3), 0x1e, 1), vec![7]);

        assert!(proto.write_checked(DeviceId(3), 0x1e, &[9]).is_ok());
        assert_eq!(handle.peek(DeviceId(3), 0x1e, 1), vec![9]);
    }

    #[test]
    fn journal_records_call_shapes() {
        let (mut proto, handle) = MockProtocol::new();
        handle.add_device(DeviceId(2), 1);
        handle.add_device(DeviceId(3), 1);

        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut windows: Vec<&mut [u8]> = vec![&mut a, &mut b];
        proto.sync_read(&[DeviceId(2), DeviceId(3)], 0x24, &mut windows);

        assert_eq!(
            handle.journal(),
            vec![Call::SyncRead {
                ids: vec![DeviceId(2), DeviceId(3)],
                addr: 0x24,
                len: 2,
            }]
        );
    }

    #[test]
    fn mock_bus_loops_scripted_bytes() {
        let (mut bus, handle) = MockBus::new();
        assert!(bus.send(&[1, 2, 3]));
        assert_eq!(handle.sent(), vec![1, 2, 3]);

        handle.push_response(&[9, 8]);
        assert!(bus.wait_readable(Duration::from_millis(1)));
        let mut buf = [0u8; 4];
        assert_eq!(bus.read(&mut buf), 2);
        assert_eq!(&buf[..2], &[9, 8]);
        assert!(!bus.wait_readable(Duration::from_millis(1)));
    }
}
