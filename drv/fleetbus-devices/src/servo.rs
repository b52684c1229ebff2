// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Position servos speaking the v1 register map.
//!
//! The two shipped models share the register layout and differ in
//! resolution and range: the RX class positions over 300° in 10 bits, the
//! MX class over 360° in 12 bits. Angles at the API are degrees, zero at
//! the horn's center; each device's `zero` and `inverse` parameters are
//! applied on top, so application code works in joint coordinates.
//!
//! Capability dispatch is through [`DxlActuator`]: anything that torques,
//! positions, and reports position/load implements it, whatever the model.

use std::sync::Arc;

use drv_fleetbus_api::DeviceId;
use drv_fleetbus_manager::{
    codec, DeviceCore, DeviceModel, FleetDevice, FleetError, RegisterDesc,
    TimedValue, TypedRegister,
};

fn ticks_u16(buf: &[u8]) -> u16 {
    u16::from(buf[0]) | (u16::from(buf[1]) << 8)
}

fn put_ticks_u16(buf: &mut [u8], ticks: u16) {
    buf[0] = ticks as u8;
    buf[1] = (ticks >> 8) as u8;
}

// RX class: 1024 steps over 300 degrees, centered on 512.

pub fn rx_encode_position(buf: &mut [u8], degrees: f32) {
    let ticks = ((degrees + 150.0) * 1023.0 / 300.0).round();
    put_ticks_u16(buf, ticks.clamp(0.0, 1023.0) as u16);
}

pub fn rx_decode_position(buf: &[u8]) -> f32 {
    f32::from(ticks_u16(buf)) * 300.0 / 1023.0 - 150.0
}

// MX class: 4096 steps over 360 degrees, centered on 2048.

pub fn mx_encode_position(buf: &mut [u8], degrees: f32) {
    let ticks = ((degrees + 180.0) * 4095.0 / 360.0).round();
    put_ticks_u16(buf, ticks.clamp(0.0, 4095.0) as u16);
}

pub fn mx_decode_position(buf: &[u8]) -> f32 {
    f32::from(ticks_u16(buf)) * 360.0 / 4095.0 - 180.0
}

// Speed is signed magnitude: bit 10 is the direction, low ten bits scale
// by the per-class step (rpm).

fn encode_speed(buf: &mut [u8], rpm: f32, step: f32) {
    let magnitude =
        ((rpm.abs() / step).round()).clamp(0.0, 1023.0) as u16;
    let ticks = if rpm < 0.0 { magnitude | 0x400 } else { magnitude };
    put_ticks_u16(buf, ticks);
}

fn decode_speed(buf: &[u8], step: f32) -> f32 {
    let ticks = ticks_u16(buf);
    let magnitude = f32::from(ticks & 0x3ff) * step;
    if ticks & 0x400 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

pub fn rx_encode_speed(buf: &mut [u8], rpm: f32) {
    encode_speed(buf, rpm, 0.111);
}

pub fn rx_decode_speed(buf: &[u8]) -> f32 {
    decode_speed(buf, 0.111)
}

pub fn mx_encode_speed(buf: &mut [u8], rpm: f32) {
    encode_speed(buf, rpm, 0.114);
}

pub fn mx_decode_speed(buf: &[u8]) -> f32 {
    decode_speed(buf, 0.114)
}

/// Load in percent of maximum torque, signed by direction.
pub fn decode_load(buf: &[u8]) -> f32 {
    let ticks = ticks_u16(buf);
    let magnitude = f32::from(ticks & 0x3ff) / 10.23;
    if ticks & 0x400 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Torque limit in percent of maximum.
pub fn encode_torque_limit(buf: &mut [u8], percent: f32) {
    let ticks = (percent * 10.23).round().clamp(0.0, 1023.0);
    put_ticks_u16(buf, ticks as u16);
}

pub fn decode_torque_limit(buf: &[u8]) -> f32 {
    f32::from(ticks_u16(buf)) / 10.23
}

/// Supply voltage in volts (the register is decivolts).
pub fn decode_voltage(buf: &[u8]) -> f32 {
    f32::from(buf[0]) / 10.0
}

/// Per-model codec and scaling table.
struct ServoClass {
    encode_position: fn(&mut [u8], f32),
    decode_position: fn(&[u8]) -> f32,
    encode_speed: fn(&mut [u8], f32),
    decode_speed: fn(&[u8]) -> f32,
}

const RX_CLASS: ServoClass = ServoClass {
    encode_position: rx_encode_position,
    decode_position: rx_decode_position,
    encode_speed: rx_encode_speed,
    decode_speed: rx_decode_speed,
};

const MX_CLASS: ServoClass = ServoClass {
    encode_position: mx_encode_position,
    decode_position: mx_decode_position,
    encode_speed: mx_encode_speed,
    decode_speed: mx_decode_speed,
};

/// Registers and behavior common to the servo family. Models embed one of
/// these and delegate.
pub struct ServoCore {
    core: DeviceCore,
    torque_enable: Arc<TypedRegister<bool>>,
    led: Arc<TypedRegister<bool>>,
    goal_position: Arc<TypedRegister<f32>>,
    moving_speed: Arc<TypedRegister<f32>>,
    torque_limit: Arc<TypedRegister<f32>>,
    present_position: Arc<TypedRegister<f32>>,
    present_speed: Arc<TypedRegister<f32>>,
    present_load: Arc<TypedRegister<f32>>,
    present_voltage: Arc<TypedRegister<f32>>,
    present_temperature: Arc<TypedRegister<i64>>,
    cw_angle_limit: Arc<TypedRegister<f32>>,
    ccw_angle_limit: Arc<TypedRegister<f32>>,
}

impl ServoCore {
    fn new(name: &str, id: DeviceId, class: &ServoClass) -> Self {
        // Window validation is static for this layout; the descriptors
        // below are all in range.
        let desc = |name, addr, len| {
            RegisterDesc::new(name, addr, len).expect("servo register window")
        };
        Self {
            core: DeviceCore::new(name, id),
            torque_enable: TypedRegister::new(
                desc("torqueEnable", 0x18, 1),
                codec::encode_bool,
                codec::decode_bool,
            ),
            led: TypedRegister::new(
                desc("led", 0x19, 1),
                codec::encode_bool,
                codec::decode_bool,
            ),
            goal_position: TypedRegister::new(
                desc("goalPosition", 0x1e, 2),
                class.encode_position,
                class.decode_position,
            ),
            moving_speed: TypedRegister::new(
                desc("movingSpeed", 0x20, 2),
                class.encode_speed,
                class.decode_speed,
            ),
            torque_limit: TypedRegister::new(
                desc("torqueLimit", 0x22, 2),
                encode_torque_limit,
                decode_torque_limit,
            ),
            present_position: TypedRegister::read_only(
                desc("presentPosition", 0x24, 2).with_period(1),
                class.decode_position,
            ),
            present_speed: TypedRegister::read_only(
                desc("presentSpeed", 0x26, 2),
                class.decode_speed,
            ),
            present_load: TypedRegister::read_only(
                desc("presentLoad", 0x28, 2),
                decode_load,
            ),
            present_voltage: TypedRegister::read_only(
                desc("presentVoltage", 0x2a, 1),
                decode_voltage,
            ),
            present_temperature: TypedRegister::read_only(
                desc("presentTemperature", 0x2b, 1),
                codec::decode_u8,
            ),
            // EEPROM backed: writes settle slowly.
            cw_angle_limit: TypedRegister::new(
                desc("cwAngleLimit", 0x06, 2).slow(),
                class.encode_position,
                class.decode_position,
            ),
            ccw_angle_limit: TypedRegister::new(
                desc("ccwAngleLimit", 0x08, 2).slow(),
                class.encode_position,
                class.decode_position,
            ),
        }
    }

    fn declare(&self) -> Result<(), FleetError> {
        self.core.add_register(&self.cw_angle_limit)?;
        self.core.add_register(&self.ccw_angle_limit)?;
        self.core.add_register(&self.torque_enable)?;
        self.core.add_register(&self.led)?;
        self.core.add_register(&self.goal_position)?;
        self.core.add_register(&self.moving_speed)?;
        self.core.add_register(&self.torque_limit)?;
        self.core.add_register(&self.present_position)?;
        self.core.add_register(&self.present_speed)?;
        self.core.add_register(&self.present_load)?;
        self.core.add_register(&self.present_voltage)?;
        self.core.add_register(&self.present_temperature)?;

        let mut params = self.core.parameters();
        params.add_bool("inverse", false)?;
        params.add_number("zero", 0.0)?;
        params.add_number("cwAngleLimit", -150.0)?;
        params.add_number("ccwAngleLimit", 150.0)?;
        Ok(())
    }

    /// Joint degrees → horn degrees, applying `zero` and `inverse`.
    fn to_horn(&self, degrees: f32) -> f32 {
        let params = self.core.parameters();
        let zero = params.get_number("zero").unwrap_or(0.0) as f32;
        let inverse = params.get_bool("inverse").unwrap_or(false);
        if inverse {
            -degrees - zero
        } else {
            degrees + zero
        }
    }

    /// Horn degrees → joint degrees.
    fn from_horn(&self, degrees: f32) -> f32 {
        let params = self.core.parameters();
        let zero = params.get_number("zero").unwrap_or(0.0) as f32;
        let inverse = params.get_bool("inverse").unwrap_or(false);
        if inverse {
            -(degrees + zero)
        } else {
            degrees - zero
        }
    }

    fn set_config(&self) -> Result<(), FleetError> {
        let (cw, ccw) = {
            let params = self.core.parameters();
            (
                params.get_number("cwAngleLimit")? as f32,
                params.get_number("ccwAngleLimit")? as f32,
            )
        };
        self.cw_angle_limit.write(cw)?;
        self.ccw_angle_limit.write(ccw)?;
        Ok(())
    }
}

/// The actuator capability: anything with torque control and position
/// sensing on the bus. Preferred over model checks — callers needing "some
/// servo" take a `&dyn DxlActuator`.
pub trait DxlActuator: FleetDevice {
    fn enable_torque(&self, enable: bool) -> Result<(), FleetError>;

    fn is_torque_enabled(&self)
        -> Result<TimedValue<bool>, FleetError>;

    /// Commands a goal in joint degrees (zero/inverse applied).
    fn set_goal_position(&self, degrees: f32) -> Result<(), FleetError>;

    /// Present position in joint degrees.
    fn present_position(&self) -> Result<TimedValue<f32>, FleetError>;

    fn set_moving_speed(&self, rpm: f32) -> Result<(), FleetError>;

    fn present_load(&self) -> Result<TimedValue<f32>, FleetError>;

    fn voltage(&self) -> Result<TimedValue<f32>, FleetError>;

    fn temperature(&self) -> Result<TimedValue<i64>, FleetError>;

    fn set_led(&self, on: bool) -> Result<(), FleetError>;
}

macro_rules! servo_model {
    (
        $(#[$meta:meta])*
        $model:ident, $type_number:expr, $type_name:expr, $class:expr
    ) => {
        $(#[$meta])*
        pub struct $model {
            servo: ServoCore,
        }

        impl $model {
            /// Raw register access, for scheduling tweaks and callbacks.
            pub fn goal_position(&self) -> &Arc<TypedRegister<f32>> {
                &self.servo.goal_position
            }

            pub fn present_position_register(
                &self,
            ) -> &Arc<TypedRegister<f32>> {
                &self.servo.present_position
            }

            pub fn present_speed(&self) -> &Arc<TypedRegister<f32>> {
                &self.servo.present_speed
            }
        }

        impl FleetDevice for $model {
            fn core(&self) -> &DeviceCore {
                &self.servo.core
            }

            fn set_config(&self) -> Result<(), FleetError> {
                self.servo.set_config()
            }
        }

        impl DeviceModel for $model {
            const TYPE_NUMBER: u16 = $type_number;
            const TYPE_NAME: &'static str = $type_name;

            fn new(name: &str, id: DeviceId) -> Arc<Self> {
                Arc::new(Self {
                    servo: ServoCore::new(name, id, &$class),
                })
            }

            fn on_init(&self) -> Result<(), FleetError> {
                self.servo.declare()
            }
        }

        impl DxlActuator for $model {
            fn enable_torque(&self, enable: bool) -> Result<(), FleetError> {
                self.servo.torque_enable.write(enable)
            }

            fn is_torque_enabled(
                &self,
            ) -> Result<TimedValue<bool>, FleetError> {
                self.servo.torque_enable.read()
            }

            fn set_goal_position(
                &self,
                degrees: f32,
            ) -> Result<(), FleetError> {
                self.servo
                    .goal_position
                    .write(self.servo.to_horn(degrees))
            }

            fn present_position(
                &self,
            ) -> Result<TimedValue<f32>, FleetError> {
                let raw = self.servo.present_position.read()?;
                Ok(TimedValue {
                    value: self.servo.from_horn(raw.value),
                    ..raw
                })
            }

            fn set_moving_speed(&self, rpm: f32) -> Result<(), FleetError> {
                self.servo.moving_speed.write(rpm)
            }

            fn present_load(&self) -> Result<TimedValue<f32>, FleetError> {
                self.servo.present_load.read()
            }

            fn voltage(&self) -> Result<TimedValue<f32>, FleetError> {
                self.servo.present_voltage.read()
            }

            fn temperature(&self) -> Result<TimedValue<i64>, FleetError> {
                self.servo.present_temperature.read()
            }

            fn set_led(&self, on: bool) -> Result<(), FleetError> {
                self.servo.led.write(on)
            }
        }
    };
}

servo_model! {
    /// RX-64 class servo: 10-bit positions over a 300 degree range.
    Rx64, 64, "Rx64", RX_CLASS
}

servo_model! {
    /// MX-64 class servo: 12-bit positions over the full turn.
    Mx64, 310, "Mx64", MX_CLASS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_position_codec_centers_and_clamps() {
        let mut buf = [0u8; 2];
        rx_encode_position(&mut buf, 0.0);
        assert_eq!(ticks_u16(&buf), 512);

        rx_encode_position(&mut buf, 150.0);
        assert_eq!(ticks_u16(&buf), 1023);

        rx_encode_position(&mut buf, -200.0);
        assert_eq!(ticks_u16(&buf), 0);

        rx_encode_position(&mut buf, 30.0);
        let back = rx_decode_position(&buf);
        assert!((back - 30.0).abs() < 0.2, "{back}");
    }

    #[test]
    fn mx_position_codec_uses_full_turn() {
        let mut buf = [0u8; 2];
        mx_encode_position(&mut buf, 0.0);
        assert_eq!(ticks_u16(&buf), 2048);

        mx_encode_position(&mut buf, 179.0);
        let back = mx_decode_position(&buf);
        assert!((back - 179.0).abs() < 0.1, "{back}");
    }

    #[test]
    fn speed_codec_is_signed_magnitude() {
        let mut buf = [0u8; 2];
        rx_encode_speed(&mut buf, -11.1);
        let ticks = ticks_u16(&buf);
        assert_eq!(ticks & 0x400, 0x400);
        assert_eq!(ticks & 0x3ff, 100);
        assert!((rx_decode_speed(&buf) + 11.1).abs() < 0.1);

        rx_encode_speed(&mut buf, 11.1);
        assert_eq!(ticks_u16(&buf) & 0x400, 0);
    }

    #[test]
    fn load_decodes_signed_percent() {
        let mut buf = [0u8; 2];
        put_ticks_u16(&mut buf, 512);
        assert!((decode_load(&buf) - 50.0).abs() < 0.1);

        put_ticks_u16(&mut buf, 512 | 0x400);
        assert!((decode_load(&buf) + 50.0).abs() < 0.1);
    }

    #[test]
    fn voltage_is_decivolts() {
        assert_eq!(decode_voltage(&[121]), 12.1);
    }
}
