// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet device plug-ins.
//!
//! One module per device family:
//!
//! - [`servo`]: position servos speaking the v1 register map, behind the
//!   [`DxlActuator`] capability trait — RX-64 (10-bit) and MX-64 (12-bit)
//!   models
//! - [`imu`]: orientation sensor publishing yaw/pitch/roll every cycle
//! - [`pressure`]: four-channel foot pressure board
//! - [`pins`]: GPIO expander board
//!
//! [`StandardRegistry`] aggregates every shipped model; a manager built
//! over it can create any of them from a scanned type number.

pub mod imu;
pub mod pins;
pub mod pressure;
pub mod servo;

pub use imu::Imu;
pub use pins::Pins;
pub use pressure::PressureSensor;
pub use servo::{DxlActuator, Mx64, Rx64};

use drv_fleetbus_manager::fleet_registry;

fleet_registry! {
    /// Every device model this crate ships.
    pub struct StandardRegistry {
        rx64: Rx64,
        mx64: Mx64,
        imus: Imu,
        pressure_boards: PressureSensor,
        pin_boards: Pins,
    }
}
