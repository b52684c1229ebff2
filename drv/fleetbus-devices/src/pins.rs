// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO expander board: one byte of inputs, one byte of outputs.

use std::sync::Arc;

use drv_fleetbus_api::DeviceId;
use drv_fleetbus_manager::{
    codec, DeviceCore, DeviceModel, FleetDevice, FleetError, RegisterDesc,
    TimedValue, TypedRegister,
};

pub struct Pins {
    core: DeviceCore,
    inputs: Arc<TypedRegister<i64>>,
    outputs: Arc<TypedRegister<i64>>,
}

impl Pins {
    /// The raw input bank, refreshed every cycle.
    pub fn inputs(&self) -> Result<TimedValue<i64>, FleetError> {
        self.inputs.read()
    }

    /// One input pin.
    pub fn input_pin(&self, pin: u8) -> Result<TimedValue<bool>, FleetError> {
        let raw = self.inputs.read()?;
        Ok(TimedValue {
            timestamp: raw.timestamp,
            value: raw.value & (1 << (pin & 7)) != 0,
            is_error: raw.is_error,
        })
    }

    /// Replaces the output bank.
    pub fn set_outputs(&self, mask: u8) -> Result<(), FleetError> {
        self.outputs.write(i64::from(mask))
    }

    /// Sets or clears one output pin in the pending bank.
    pub fn set_output_pin(
        &self,
        pin: u8,
        on: bool,
    ) -> Result<(), FleetError> {
        let current = self.outputs.written_value();
        let bit = 1i64 << (pin & 7);
        let next = if on { current | bit } else { current & !bit };
        self.outputs.write(next)
    }
}

impl FleetDevice for Pins {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

impl DeviceModel for Pins {
    const TYPE_NUMBER: u16 = 6000;
    const TYPE_NAME: &'static str = "Pins";

    fn new(name: &str, id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            core: DeviceCore::new(name, id),
            inputs: TypedRegister::read_only(
                RegisterDesc::new("inputs", 0x18, 1)
                    .expect("pins input window")
                    .with_period(1),
                codec::decode_u8,
            ),
            outputs: TypedRegister::new(
                RegisterDesc::new("outputs", 0x19, 1)
                    .expect("pins output window"),
                codec::encode_u8,
                codec::decode_u8,
            ),
        })
    }

    fn on_init(&self) -> Result<(), FleetError> {
        self.core.add_register(&self.inputs)?;
        self.core.add_register(&self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_pins_accumulate_in_the_pending_bank() {
        let dev = Pins::new("gpio", DeviceId(30));
        dev.set_output_pin(0, true).unwrap();
        dev.set_output_pin(3, true).unwrap();
        assert_eq!(dev.outputs.written_value(), 0b1001);
        dev.set_output_pin(0, false).unwrap();
        assert_eq!(dev.outputs.written_value(), 0b1000);
    }
}
