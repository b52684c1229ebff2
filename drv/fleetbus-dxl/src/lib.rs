// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamixel-v1-style wire protocol.
//!
//! Frame layout, both directions:
//!
//! ```text
//! 0xFF 0xFF <id> <len> <instr|error> <param ...> <checksum>
//! ```
//!
//! `len` counts the instruction/error byte, the parameters, and the
//! checksum; the checksum is the ones' complement of the byte sum from `id`
//! through the last parameter. Responses carry the device's error byte
//! where requests carry the instruction.
//!
//! The synchronized forms address [`BROADCAST_ID`]: sync-write carries
//! `(id, data)` tuples and elicits no responses; sync-read carries the id
//! list and the devices answer with one status packet each, in the order
//! the ids were listed. Since a broadcast write cannot be checked on the
//! wire, [`Protocol::sync_write_checked`] degrades to per-device checked
//! writes.

use std::time::Duration;

use drv_fleetbus_api::{
    Bus, DeviceId, ParameterList, Protocol, ProtocolFactory, ResponseState,
    BROADCAST_ID,
};

const HEADER: [u8; 2] = [0xff, 0xff];

/// Overhead bytes around the parameters: header, id, length, instruction,
/// checksum.
const OVERHEAD: usize = 6;

const INSTR_PING: u8 = 0x01;
const INSTR_READ: u8 = 0x02;
const INSTR_WRITE: u8 = 0x03;
const INSTR_SYNC_WRITE: u8 = 0x83;
const INSTR_SYNC_READ: u8 = 0x84;

/// Address of the torque-enable register used by the broadcast emergency
/// controls.
const TORQUE_ENABLE_ADDR: u8 = 0x18;

// Device error byte bits.
const ERR_VOLTAGE: u8 = 1 << 0;
const ERR_ANGLE_LIMIT: u8 = 1 << 1;
const ERR_OVERHEAT: u8 = 1 << 2;
const ERR_RANGE: u8 = 1 << 3;
const ERR_CHECKSUM: u8 = 1 << 4;
const ERR_OVERLOAD: u8 = 1 << 5;
const ERR_INSTRUCTION: u8 = 1 << 6;

fn frame(id: DeviceId, instr: u8, params: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OVERHEAD + params.len());
    out.extend_from_slice(&HEADER);
    out.push(id.0);
    out.push((params.len() + 2) as u8);
    out.push(instr);
    out.extend_from_slice(params);
    let sum = out[2..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    out.push(!sum);
    out
}

/// Maps a status packet's error byte. Device-condition bits are warnings
/// and keep `OK`; protocol-level complaints drop it.
fn map_error_byte(error: u8) -> ResponseState {
    let mut state = ResponseState::empty();
    if error & ERR_VOLTAGE != 0 {
        state |= ResponseState::BAD_VOLTAGE;
    }
    if error & (ERR_ANGLE_LIMIT | ERR_RANGE) != 0 {
        state |= ResponseState::ALERT;
    }
    if error & ERR_OVERHEAT != 0 {
        state |= ResponseState::OVERHEAT;
    }
    if error & ERR_OVERLOAD != 0 {
        state |= ResponseState::OVERLOAD;
    }
    if error & ERR_CHECKSUM != 0 {
        state |= ResponseState::DEVICE_BAD_CHECKSUM;
    }
    if error & ERR_INSTRUCTION != 0 {
        state |= ResponseState::DEVICE_BAD_INSTRUCTION;
    }
    if state.is_error() {
        state
    } else {
        state | ResponseState::OK
    }
}

/// The v1 protocol over an owned transport.
pub struct DxlV1 {
    bus: Box<dyn Bus>,
    params: ParameterList,
}

impl DxlV1 {
    pub fn new(bus: Box<dyn Bus>) -> Self {
        let mut params = ParameterList::new();
        // Response timeout and post-write settle, both in seconds.
        let _ = params.add_number("timeout", 0.005);
        let _ = params.add_number("waitAfterWrite", 0.0);
        Self { bus, params }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.params.get_number("timeout").unwrap_or(0.005).max(0.0),
        )
    }

    fn settle_after_write(&self) {
        let settle =
            self.params.get_number("waitAfterWrite").unwrap_or(0.0);
        if settle > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(settle));
        }
    }

    fn send_frame(&mut self, bytes: &[u8]) {
        if !self.bus.send(bytes) {
            log::warn!("short write on bus, frame dropped");
        }
        self.bus.flush();
    }

    /// Receives one status packet for `expected` carrying `payload` data
    /// bytes, delivering them into `data`.
    fn receive_status(
        &mut self,
        expected: DeviceId,
        data: &mut [u8],
    ) -> ResponseState {
        let timeout = self.timeout();
        let total = OVERHEAD + data.len();
        let mut raw: Vec<u8> = Vec::with_capacity(total);

        while raw.len() < total {
            if self.bus.available() == 0
                && !self.bus.wait_readable(timeout)
            {
                return ResponseState::QUIET;
            }
            let mut chunk = [0u8; 64];
            let want = (total - raw.len()).min(chunk.len());
            let got = self.bus.read(&mut chunk[..want]);
            if got == 0 {
                return ResponseState::QUIET;
            }
            raw.extend_from_slice(&chunk[..got]);

            // Resynchronize on the header in case stale bytes from an
            // earlier timed-out exchange are still in the pipe.
            while raw.len() >= 2 && raw[..2] != HEADER {
                raw.remove(0);
            }
        }

        let sum = raw[2..total - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if raw[total - 1] != !sum {
            return ResponseState::BAD_CHECKSUM;
        }
        if raw[2] != expected.0 {
            return ResponseState::BAD_ID;
        }
        if usize::from(raw[3]) != data.len() + 2 {
            return ResponseState::BAD_SIZE;
        }

        let state = map_error_byte(raw[4]);
        if state.is_ok() {
            data.copy_from_slice(&raw[5..5 + data.len()]);
        }
        state
    }
}

impl Protocol for DxlV1 {
    fn ping(&mut self, id: DeviceId) -> bool {
        self.bus.clear_input();
        self.send_frame(&frame(id, INSTR_PING, &[]));
        self.receive_status(id, &mut []).is_ok()
    }

    fn read(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &mut [u8],
    ) -> ResponseState {
        self.bus.clear_input();
        self.send_frame(&frame(id, INSTR_READ, &[addr, data.len() as u8]));
        self.receive_status(id, data)
    }

    fn write(&mut self, id: DeviceId, addr: u8, data: &[u8]) {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(addr);
        params.extend_from_slice(data);
        self.send_frame(&frame(id, INSTR_WRITE, &params));
        self.settle_after_write();
    }

    fn write_checked(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &[u8],
    ) -> ResponseState {
        self.bus.clear_input();
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(addr);
        params.extend_from_slice(data);
        self.send_frame(&frame(id, INSTR_WRITE, &params));
        let state = self.receive_status(id, &mut []);
        self.settle_after_write();
        state
    }

    fn sync_read(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &mut [&mut [u8]],
    ) -> Vec<ResponseState> {
        let len = data.first().map_or(0, |d| d.len());
        self.bus.clear_input();

        let mut params = Vec::with_capacity(2 + ids.len());
        params.push(addr);
        params.push(len as u8);
        params.extend(ids.iter().map(|id| id.0));
        self.send_frame(&frame(BROADCAST_ID, INSTR_SYNC_READ, &params));

        // One status packet per addressed device, in request order.
        ids.iter()
            .zip(data.iter_mut())
            .map(|(&id, window)| self.receive_status(id, window))
            .collect()
    }

    fn sync_write(&mut self, ids: &[DeviceId], addr: u8, data: &[&[u8]]) {
        let len = data.first().map_or(0, |d| d.len());
        let mut params = Vec::with_capacity(2 + ids.len() * (len + 1));
        params.push(addr);
        params.push(len as u8);
        for (&id, window) in ids.iter().zip(data) {
            params.push(id.0);
            params.extend_from_slice(window);
        }
        self.send_frame(&frame(BROADCAST_ID, INSTR_SYNC_WRITE, &params));
        self.settle_after_write();
    }

    fn sync_write_checked(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &[&[u8]],
    ) -> Vec<ResponseState> {
        // Broadcast writes are unacknowledged on this protocol; degrade to
        // checked per-device writes.
        ids.iter()
            .zip(data)
            .map(|(&id, window)| self.write_checked(id, addr, window))
            .collect()
    }

    fn emergency_stop(&mut self) {
        self.write(BROADCAST_ID, TORQUE_ENABLE_ADDR, &[0]);
    }

    fn exit_emergency_state(&mut self) {
        self.write(BROADCAST_ID, TORQUE_ENABLE_ADDR, &[1]);
    }

    fn parameters(&self) -> &ParameterList {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterList {
        &mut self.params
    }
}

/// Registers [`DxlV1`] under the name `dxl-v1`.
pub struct DxlV1Factory;

impl ProtocolFactory for DxlV1Factory {
    fn name(&self) -> &'static str {
        "dxl-v1"
    }

    fn build(&self, bus: Box<dyn Bus>) -> Box<dyn Protocol> {
        Box::new(DxlV1::new(bus))
    }
}
