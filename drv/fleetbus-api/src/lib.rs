// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract between the fleet manager and its bus plumbing.
//!
//! A *fleet* is a set of smart peripherals (servos, IMUs, pressure sensors,
//! GPIO boards) sharing one half-duplex serial bus, each addressable by a
//! one-byte id. Exactly one transaction may be in flight on the bus at a
//! time; the manager enforces that, and everything below it is expressed as
//! two traits:
//!
//! - [`Bus`]: a byte pipe with coarse timeout control. Concrete transports
//!   (serial ports, TCP bridges) implement this; they are expected to absorb
//!   transport-level failures internally (log a warning, re-open, return
//!   short counts) rather than surface them as errors.
//! - [`Protocol`]: the frame layer. A protocol implementation owns a `Bus`
//!   and turns register-window operations (single and synchronized
//!   multi-device forms) into wire frames, reporting the outcome of every
//!   addressed exchange as a [`ResponseState`] bit set.
//!
//! Protocol implementations register themselves through a
//! [`ProtocolFactory`] so the manager can construct one from a configured
//! name. Tunable protocol knobs (response timeout and friends) live in a
//! [`ParameterList`], the same strict-JSON parameter container used by
//! devices.

mod params;
mod protocol;
mod response;

pub use params::{ParamError, ParamKind, Parameter, ParameterList};
pub use protocol::{Protocol, ProtocolFactory};
pub use response::ResponseState;

use std::time::Duration;

/// Bus address of one device. Valid device ids occupy
/// [`DEVICE_ID_MIN`]..=[`DEVICE_ID_MAX`]; [`BROADCAST_ID`] addresses every
/// device at once and never elicits a response.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub u8);

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device model number, as read from the fixed model register at
/// [`TYPE_NUMBER_ADDR`].
pub type TypeNumber = u16;

/// First assignable device id.
pub const DEVICE_ID_MIN: u8 = 1;
/// Last assignable device id.
pub const DEVICE_ID_MAX: u8 = 253;
/// Broadcast address understood by every device.
pub const BROADCAST_ID: DeviceId = DeviceId(0xfe);

/// Length of each device's register address space. Register windows must
/// fit: `addr + len <= ADDR_SPACE_LEN`.
pub const ADDR_SPACE_LEN: usize = 0xff;

/// Address of the 2-byte model-number register present on every device.
pub const TYPE_NUMBER_ADDR: u8 = 0x00;

/// Half-duplex byte transport.
///
/// Errors do not appear in these signatures: a transport failure shows up as
/// a short or zero count, and the implementation is responsible for its own
/// recovery (typically a logged re-open loop). The frame layer treats short
/// reads like silence and reports them as [`ResponseState::QUIET`].
pub trait Bus: Send {
    /// Writes `data` to the wire. Returns false if the transport could not
    /// accept all of it.
    fn send(&mut self, data: &[u8]) -> bool;

    /// Blocks until at least one byte is readable or `timeout` elapses.
    /// Returns whether data is readable.
    fn wait_readable(&mut self, timeout: Duration) -> bool;

    /// Number of bytes that can be read without blocking.
    fn available(&mut self) -> usize;

    /// Reads up to `data.len()` bytes, returning how many were read.
    fn read(&mut self, data: &mut [u8]) -> usize;

    /// Blocks until buffered output has been handed to the transport.
    fn flush(&mut self);

    /// Discards any unread input. Called by protocols before a request to
    /// drop stale bytes from earlier, timed-out exchanges.
    fn clear_input(&mut self);
}

/// A transport that goes nowhere: writes are discarded, reads never become
/// ready. Stands in for protocols that need no wire (mocks) when no port is
/// configured.
pub struct NullBus;

impl Bus for NullBus {
    fn send(&mut self, _data: &[u8]) -> bool {
        true
    }

    fn wait_readable(&mut self, _timeout: Duration) -> bool {
        false
    }

    fn available(&mut self) -> usize {
        0
    }

    fn read(&mut self, _data: &mut [u8]) -> usize {
        0
    }

    fn flush(&mut self) {}

    fn clear_input(&mut self) {}
}
