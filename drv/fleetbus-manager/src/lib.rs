// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduled, batched, double-buffered register I/O for device fleets.
//!
//! This crate is the core of the fleet stack: it mediates between user
//! threads that read sensor values and command actuators, and one
//! half-duplex bus on which only a single transaction may be in flight.
//!
//! The moving parts:
//!
//! - [`TypedRegister`]: one typed field of one device, double-buffered.
//!   Users `write()` typed values (aggregated across a cycle by a chosen
//!   [`Aggregation`] policy) and `read()` the last swapped-in value with its
//!   timestamp. Dirty flags mark registers for the next cycle; force flags
//!   (and immediate mode) bypass the cycle with bounded-retry bus I/O.
//! - [`DeviceCore`] / [`DeviceModel`]: one addressable peripheral — a set of
//!   registers, a set of persistent parameters, and health state derived
//!   from every bus response.
//! - [`TypedRegistry`] and the [`fleet_registry!`] macro: per-model device
//!   stores with id/name indexes and JSON persistence, unioned into one
//!   aggregate registry that can create devices from scanned type numbers.
//! - [`Manager`]: the cycle engine. Each cycle swaps freshly read values
//!   into user view, runs device hooks, selects dirty/periodic registers,
//!   coalesces them into the fewest wire transactions (contiguous windows
//!   per device, merged into synchronized same-window transactions across
//!   devices), and executes all writes before all reads. A two-phase
//!   barrier (the `cyclegate` crate) lets cooperative user threads run in
//!   lockstep with the cycle.
//!
//! Wire access is abstracted behind the `Protocol`/`Bus` traits of
//! `drv-fleetbus-api`; this crate never frames a byte itself.

mod aggregation;
mod batch;
mod device;
mod error;
mod manager;
mod register;
mod registers;
mod registry;
mod stats;

pub use aggregation::{Aggregation, RegValue};
pub use device::{DeviceCore, DeviceModel, FleetDevice, HealthSnapshot};
pub use error::FleetError;
pub use manager::Manager;
pub use register::{
    codec, CallManager, RawRegister, RegisterDesc, TimedValue, TypedRegister,
};
pub use registers::RegisterSet;
pub use registry::{FleetRegistry, TypedAccess, TypedRegistry};
pub use stats::Statistics;

use std::time::Duration;

/// Maximum register window length in bytes.
pub const MAX_REG_LEN: usize = 4;

/// Delay observed after writing any slow (EEPROM-backed) register, before
/// further bus activity.
pub const SLOW_REGISTER_DELAY: Duration = Duration::from_millis(100);

/// Retry bound for the force (immediate) read/write paths.
pub const MAX_FORCE_RETRIES: u32 = 20;

/// Address of the one-byte id register shared by all fleet devices.
pub const ID_ADDR: u8 = 0x03;
