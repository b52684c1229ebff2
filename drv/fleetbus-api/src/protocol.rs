// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frame-level request/response contract.

use crate::params::ParameterList;
use crate::response::ResponseState;
use crate::{Bus, DeviceId};

/// One wire protocol, bound to the [`Bus`] it was built over.
///
/// Implementations are not reentrant; the caller serializes access (the
/// manager does so with its bus mutex). Addresses and lengths refer to the
/// target device's register space; a window is `addr..addr + data.len()`.
///
/// For the synchronized forms, `ids` and the per-device buffer slices are
/// parallel: entry `i` of each belongs to device `ids[i]`. All windows of a
/// synchronized call share one `addr` and one length.
pub trait Protocol: Send {
    /// Low-overhead reachability probe.
    fn ping(&mut self, id: DeviceId) -> bool;

    /// Reads `data.len()` bytes at `addr`. `data` is only valid if the
    /// returned state [`is_ok`](ResponseState::is_ok).
    fn read(&mut self, id: DeviceId, addr: u8, data: &mut [u8])
        -> ResponseState;

    /// Writes `data` at `addr`, fire-and-forget: no status frame is awaited.
    fn write(&mut self, id: DeviceId, addr: u8, data: &[u8]);

    /// Writes `data` at `addr` and waits for the device's status frame.
    fn write_checked(
        &mut self,
        id: DeviceId,
        addr: u8,
        data: &[u8],
    ) -> ResponseState;

    /// Reads the same window from many devices in one bus transaction,
    /// delivering each response into the caller's per-device buffer. One
    /// state per id, in `ids` order.
    fn sync_read(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &mut [&mut [u8]],
    ) -> Vec<ResponseState>;

    /// Writes one window per device in one broadcast transaction, no
    /// response.
    fn sync_write(&mut self, ids: &[DeviceId], addr: u8, data: &[&[u8]]);

    /// Like [`sync_write`](Self::sync_write) but collects one status per
    /// device. Protocols whose broadcast form cannot elicit responses fall
    /// back to per-device checked writes.
    fn sync_write_checked(
        &mut self,
        ids: &[DeviceId],
        addr: u8,
        data: &[&[u8]],
    ) -> Vec<ResponseState>;

    /// Broadcasts the protocol's "stop actuation" command (e.g. torque off
    /// on every servo).
    fn emergency_stop(&mut self);

    /// Broadcasts the inverse of [`emergency_stop`](Self::emergency_stop).
    fn exit_emergency_state(&mut self);

    /// Tunable protocol knobs (response timeout and friends).
    fn parameters(&self) -> &ParameterList;
    fn parameters_mut(&mut self) -> &mut ParameterList;
}

/// Constructs a [`Protocol`] from a configured name.
///
/// The manager keeps a list of factories; `set_protocol(port, baud, name)`
/// builds the bus, then asks the factory whose
/// [`name`](ProtocolFactory::name) matches to wrap it.
pub trait ProtocolFactory: Send + Sync {
    /// Name this factory answers to in configuration.
    fn name(&self) -> &'static str;

    /// Builds a fresh protocol instance over `bus`.
    fn build(&self, bus: Box<dyn Bus>) -> Box<dyn Protocol>;
}
