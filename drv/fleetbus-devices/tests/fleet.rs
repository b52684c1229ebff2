// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shipped device models driven through a manager over the mock protocol.

use std::sync::Arc;

use drv_fleetbus_api::DeviceId;
use drv_fleetbus_devices::{
    DxlActuator, Imu, Mx64, PressureSensor, Rx64, StandardRegistry,
};
use drv_fleetbus_manager::{DeviceModel, FleetDevice, Manager};
use drv_fleetbus_mock::{Call, MockHandle, MockProtocol};

fn setup() -> (Manager<StandardRegistry>, MockHandle) {
    let manager = Manager::new(StandardRegistry::new());
    let (proto, handle) = MockProtocol::new();
    manager.set_protocol_instance(Box::new(proto));
    (manager, handle)
}

#[test]
fn goal_position_applies_zero_and_inverse() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(5), Rx64::TYPE_NUMBER);
    let servo = manager.add_device::<Rx64>("knee", DeviceId(5)).unwrap();

    {
        let mut params = servo.core().parameters();
        params.set_number("zero", 10.0).unwrap();
        params.set_bool("inverse", true).unwrap();
    }

    // Joint 30 degrees -> horn -(30) - 10 = -40 -> (110/300)*1023 = 375.
    servo.set_goal_position(30.0).unwrap();
    manager.flush().unwrap();
    assert_eq!(handle.peek(DeviceId(5), 0x1e, 2), vec![0x77, 0x01]);
}

#[test]
fn present_position_reads_every_cycle() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(5), Rx64::TYPE_NUMBER);
    let servo = manager.add_device::<Rx64>("knee", DeviceId(5)).unwrap();

    handle.poke(DeviceId(5), 0x24, &512u16.to_le_bytes());
    manager.flush().unwrap();
    manager.force_swap();

    let position = servo.present_position().unwrap();
    assert!(!position.is_error);
    // Tick 512 is the horn center.
    assert!(position.value.abs() < 0.2, "{}", position.value);
}

#[test]
fn set_config_pushes_angle_limits_to_eeprom() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(5), Rx64::TYPE_NUMBER);
    let servo = manager.add_device::<Rx64>("knee", DeviceId(5)).unwrap();

    {
        let mut params = servo.core().parameters();
        params.set_number("cwAngleLimit", -90.0).unwrap();
        params.set_number("ccwAngleLimit", 90.0).unwrap();
    }

    // Presence gates set_devices_config; learn it from a ping sweep.
    manager.check_devices().unwrap();
    manager.set_devices_config().unwrap();
    manager.flush().unwrap();

    assert_eq!(handle.peek(DeviceId(5), 0x06, 2), vec![0xcd, 0x00]);
    assert_eq!(handle.peek(DeviceId(5), 0x08, 2), vec![0x32, 0x03]);
}

#[test]
fn actuator_capability_erases_the_model() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(2), Rx64::TYPE_NUMBER);
    handle.add_device(DeviceId(3), Mx64::TYPE_NUMBER);
    let rx = manager.add_device::<Rx64>("left", DeviceId(2)).unwrap();
    let mx = manager.add_device::<Mx64>("right", DeviceId(3)).unwrap();

    let actuators: Vec<Arc<dyn DxlActuator>> = vec![rx, mx];
    for actuator in &actuators {
        actuator.enable_torque(true).unwrap();
        actuator.set_goal_position(0.0).unwrap();
    }
    manager.flush().unwrap();

    // Same joint angle, model-specific wire values: RX centers on 512,
    // MX on 2048.
    assert_eq!(handle.peek(DeviceId(2), 0x1e, 2), vec![0x00, 0x02]);
    assert_eq!(handle.peek(DeviceId(3), 0x1e, 2), vec![0x00, 0x08]);
    assert_eq!(handle.peek(DeviceId(2), 0x18, 1), vec![1]);
    assert_eq!(handle.peek(DeviceId(3), 0x18, 1), vec![1]);
}

#[test]
fn imu_angles_batch_into_one_read() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(9), Imu::TYPE_NUMBER);
    let imu = manager.add_device::<Imu>("torso", DeviceId(9)).unwrap();

    handle.poke(DeviceId(9), 0x1a, &160i16.to_le_bytes()); // yaw 10
    handle.poke(DeviceId(9), 0x1c, &(-320i16).to_le_bytes()); // pitch -20
    handle.poke(DeviceId(9), 0x1e, &480i16.to_le_bytes()); // roll 30

    manager.flush().unwrap();
    manager.force_swap();

    // Three contiguous windows, one transaction.
    assert_eq!(
        handle.journal(),
        vec![Call::Read {
            id: DeviceId(9),
            addr: 0x1a,
            len: 6,
        }]
    );
    assert_eq!(imu.yaw().unwrap().value, 10.0);
    assert_eq!(imu.pitch().unwrap().value, -20.0);
    assert_eq!(imu.roll().unwrap().value, 30.0);
}

#[test]
fn pressure_channels_apply_tare() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(40), PressureSensor::TYPE_NUMBER);
    let feet = manager
        .add_device::<PressureSensor>("left_foot", DeviceId(40))
        .unwrap();

    handle.poke(DeviceId(40), 0x24, &[0x10, 0x27, 0x00]); // 10000
    manager.flush().unwrap();
    manager.force_swap();

    assert_eq!(feet.pressure(0).unwrap().value, 10000.0);

    feet.core()
        .parameters()
        .set_number("zero1", 400.0)
        .unwrap();
    assert_eq!(feet.pressure(0).unwrap().value, 9600.0);

    assert!(feet.pressure(7).is_err());
}

#[test]
fn scan_builds_a_mixed_fleet() {
    let (manager, handle) = setup();
    handle.add_device(DeviceId(2), Rx64::TYPE_NUMBER);
    handle.add_device(DeviceId(3), Mx64::TYPE_NUMBER);
    handle.add_device(DeviceId(9), Imu::TYPE_NUMBER);
    handle.add_device(DeviceId(40), PressureSensor::TYPE_NUMBER);

    manager.scan().unwrap();

    assert!(manager.device::<Rx64>("Rx64_2").is_ok());
    assert!(manager.device::<Mx64>("Mx64_3").is_ok());
    assert!(manager.device::<Imu>("Imu_9").is_ok());
    assert!(manager
        .device::<PressureSensor>("PressureSensor_40")
        .is_ok());
    assert!(manager.device_any("Imu_9").unwrap().core().is_present());
}
