// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orientation sensor board.
//!
//! Publishes fused Euler angles as three read-only registers, refreshed
//! every cycle. The wire format is signed sixteenths of a degree, little
//! endian.

use std::sync::Arc;

use drv_fleetbus_api::DeviceId;
use drv_fleetbus_manager::{
    DeviceCore, DeviceModel, FleetDevice, FleetError, RegisterDesc,
    TimedValue, TypedRegister,
};

/// Signed 1/16-degree fixed point.
pub fn decode_euler(buf: &[u8]) -> f32 {
    let raw = i16::from_le_bytes([buf[0], buf[1]]);
    f32::from(raw) / 16.0
}

pub struct Imu {
    core: DeviceCore,
    yaw: Arc<TypedRegister<f32>>,
    pitch: Arc<TypedRegister<f32>>,
    roll: Arc<TypedRegister<f32>>,
}

impl Imu {
    pub fn yaw(&self) -> Result<TimedValue<f32>, FleetError> {
        self.yaw.read()
    }

    pub fn pitch(&self) -> Result<TimedValue<f32>, FleetError> {
        self.pitch.read()
    }

    pub fn roll(&self) -> Result<TimedValue<f32>, FleetError> {
        self.roll.read()
    }
}

impl FleetDevice for Imu {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

impl DeviceModel for Imu {
    const TYPE_NUMBER: u16 = 1000;
    const TYPE_NAME: &'static str = "Imu";

    fn new(name: &str, id: DeviceId) -> Arc<Self> {
        let desc = |name, addr| {
            RegisterDesc::new(name, addr, 2)
                .expect("imu register window")
                .with_period(1)
        };
        Arc::new(Self {
            core: DeviceCore::new(name, id),
            yaw: TypedRegister::read_only(desc("yaw", 0x1a), decode_euler),
            pitch: TypedRegister::read_only(
                desc("pitch", 0x1c),
                decode_euler,
            ),
            roll: TypedRegister::read_only(desc("roll", 0x1e), decode_euler),
        })
    }

    fn on_init(&self) -> Result<(), FleetError> {
        self.core.add_register(&self.yaw)?;
        self.core.add_register(&self.pitch)?;
        self.core.add_register(&self.roll)
    }
}
