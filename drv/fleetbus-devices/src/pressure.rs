// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four-channel pressure board (one load cell per foot cleat).
//!
//! Channels are 3-byte raw counts refreshed every cycle; each carries a
//! persistent `zero` offset parameter subtracted at the API, so readings
//! are relative to an unloaded tare.

use std::sync::Arc;

use drv_fleetbus_api::DeviceId;
use drv_fleetbus_manager::{
    codec, DeviceCore, DeviceModel, FleetDevice, FleetError, RegisterDesc,
    TimedValue, TypedRegister,
};

pub const CHANNELS: usize = 4;

pub struct PressureSensor {
    core: DeviceCore,
    channels: [Arc<TypedRegister<i64>>; CHANNELS],
}

impl PressureSensor {
    /// Tared reading of one channel (0-based).
    pub fn pressure(
        &self,
        channel: usize,
    ) -> Result<TimedValue<f64>, FleetError> {
        let reg = self.channels.get(channel).ok_or_else(|| {
            FleetError::UnknownRegister {
                device: self.core.id(),
                name: format!("pressure{}", channel + 1),
            }
        })?;
        let raw = reg.read()?;
        let zero = self
            .core
            .parameters()
            .get_number(&format!("zero{}", channel + 1))
            .unwrap_or(0.0);
        Ok(TimedValue {
            timestamp: raw.timestamp,
            value: raw.value as f64 - zero,
            is_error: raw.is_error,
        })
    }

    /// Stores the current raw readings as the tare offsets.
    pub fn tare(&self) -> Result<(), FleetError> {
        for (index, reg) in self.channels.iter().enumerate() {
            let raw = reg.read()?;
            self.core
                .parameters()
                .set_number(&format!("zero{}", index + 1), raw.value as f64)?;
        }
        Ok(())
    }
}

impl FleetDevice for PressureSensor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

impl DeviceModel for PressureSensor {
    const TYPE_NUMBER: u16 = 5000;
    const TYPE_NAME: &'static str = "PressureSensor";

    fn new(name: &str, id: DeviceId) -> Arc<Self> {
        let channel = |index: usize| {
            let desc = RegisterDesc::new(
                &format!("pressure{}", index + 1),
                (0x24 + 3 * index) as u8,
                3,
            )
            .expect("pressure register window")
            .with_period(1);
            TypedRegister::read_only(desc, codec::decode_u24_le)
        };
        Arc::new(Self {
            core: DeviceCore::new(name, id),
            channels: [channel(0), channel(1), channel(2), channel(3)],
        })
    }

    fn on_init(&self) -> Result<(), FleetError> {
        for reg in &self.channels {
            self.core.add_register(reg)?;
        }
        let mut params = self.core.parameters();
        for index in 1..=CHANNELS {
            params.add_number(&format!("zero{index}"), 0.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_contiguous_three_byte_windows() {
        let dev = PressureSensor::new("feet", DeviceId(40));
        let addrs: Vec<u8> =
            dev.channels.iter().map(|c| c.desc().addr()).collect();
        assert_eq!(addrs, vec![0x24, 0x27, 0x2a, 0x2d]);
        assert!(dev.channels.iter().all(|c| c.desc().len() == 3));
    }
}
