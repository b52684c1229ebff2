// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structural failure taxonomy.
//!
//! Transient per-register I/O failures never surface here: they re-mark the
//! register dirty and flow through [`ResponseState`] accounting. This enum
//! is for invariant violations and configuration mistakes, which abort the
//! offending operation and are not retried.

use drv_fleetbus_api::{DeviceId, ParamError, ResponseState, TypeNumber};

#[derive(Debug)]
pub enum FleetError {
    /// Register window exceeds the per-register length cap.
    RegisterTooLong { name: String, len: usize },
    /// Register window does not fit the device address space.
    RegisterOutOfRange { name: String, addr: u8, len: usize },
    /// Register window shares bytes with an existing register.
    RegisterOverlap { name: String, other: String },
    /// A register with this name already exists on the device.
    DuplicateRegister(String),
    /// `write()` on a read-only register.
    ReadOnlyWrite(String),
    /// Register or device used before being attached to a manager.
    NotAttached(String),
    /// No device with this name.
    UnknownDeviceName(String),
    /// No device with this id.
    UnknownDeviceId(DeviceId),
    /// A device with this name or id already exists (across all types).
    DuplicateDevice { name: String, id: DeviceId },
    /// No register with this name on the addressed device.
    UnknownRegister { device: DeviceId, name: String },
    /// Bus operation attempted before `set_protocol` configured one.
    ProtocolNotConfigured,
    /// No registered protocol factory answers to this name.
    UnknownProtocol(String),
    /// The bus transport could not be opened.
    BusOpen { port: String, detail: String },
    /// Scan found a device whose type number conflicts with what the
    /// registry already knows about that id.
    ScanTypeMismatch {
        id: DeviceId,
        found: TypeNumber,
        known: TypeNumber,
        known_name: String,
    },
    /// Scan found a type number no registry entry supports.
    UnsupportedType(TypeNumber),
    /// Force-read retries exhausted.
    ForceReadFailed {
        id: DeviceId,
        register: String,
        state: ResponseState,
    },
    /// Force-write retries exhausted.
    ForceWriteFailed {
        id: DeviceId,
        register: String,
        state: ResponseState,
    },
    /// The device did not answer the probe that must precede an id change.
    DeviceNotResponding(DeviceId),
    /// A persisted document names a device whose identity disagrees with
    /// the registry (wrong name for the id, or vice versa).
    ConfigDeviceMismatch { id: DeviceId, name: String },
    /// A persisted document key matches no device type and no built-in
    /// section.
    UnknownConfigKey(String),
    /// A persisted document section has the wrong JSON shape.
    ConfigMalformed(String),
    /// The cycle manager thread is enrolled as cooperative.
    ManagerEnrolled,
    /// Cooperative enrollment misuse (double enroll / withdraw without
    /// enroll).
    Cooperative(cyclegate::GateError),
    /// Parameter container failure.
    Param(ParamError),
    /// Config file I/O failure.
    Io(std::io::Error),
    /// Config file is not valid JSON.
    Json(serde_json::Error),
}

impl core::fmt::Display for FleetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RegisterTooLong { name, len } => {
                write!(f, "register {name}: length {len} exceeds cap")
            }
            Self::RegisterOutOfRange { name, addr, len } => write!(
                f,
                "register {name}: window {addr:#04x}+{len} is outside the \
                 device address space"
            ),
            Self::RegisterOverlap { name, other } => write!(
                f,
                "register {name} overlaps existing register {other}"
            ),
            Self::DuplicateRegister(name) => {
                write!(f, "register name already added: {name}")
            }
            Self::ReadOnlyWrite(name) => {
                write!(f, "write to read-only register: {name}")
            }
            Self::NotAttached(name) => {
                write!(f, "{name} is not attached to a manager")
            }
            Self::UnknownDeviceName(name) => {
                write!(f, "device name not found: {name}")
            }
            Self::UnknownDeviceId(id) => {
                write!(f, "device id not found: {id}")
            }
            Self::DuplicateDevice { name, id } => {
                write!(f, "device name or id already added: {name} (id {id})")
            }
            Self::UnknownRegister { device, name } => {
                write!(f, "device {device} has no register named {name}")
            }
            Self::ProtocolNotConfigured => {
                write!(f, "protocol is not configured")
            }
            Self::UnknownProtocol(name) => {
                write!(f, "unknown protocol name: {name}")
            }
            Self::BusOpen { port, detail } => {
                write!(f, "bus open failed on port {port}: {detail}")
            }
            Self::ScanTypeMismatch {
                id,
                found,
                known,
                known_name,
            } => write!(
                f,
                "scan type mismatch: id {id} reports type {found} but is \
                 already known as {known_name} with type {known}"
            ),
            Self::UnsupportedType(t) => {
                write!(f, "scanned type number is not supported: {t}")
            }
            Self::ForceReadFailed {
                id,
                register,
                state,
            } => write!(
                f,
                "retries exhausted reading {register} on device {id} \
                 (last state {state:?})"
            ),
            Self::ForceWriteFailed {
                id,
                register,
                state,
            } => write!(
                f,
                "retries exhausted writing {register} on device {id} \
                 (last state {state:?})"
            ),
            Self::DeviceNotResponding(id) => {
                write!(f, "device {id} is not responding")
            }
            Self::ConfigDeviceMismatch { id, name } => write!(
                f,
                "config device entry {name} (id {id}) does not match the \
                 registry"
            ),
            Self::UnknownConfigKey(key) => {
                write!(f, "config key matches no device type: {key}")
            }
            Self::ConfigMalformed(what) => {
                write!(f, "config section is malformed: {what}")
            }
            Self::ManagerEnrolled => write!(
                f,
                "cycle thread must not be enrolled as cooperative"
            ),
            Self::Cooperative(e) => write!(f, "cooperative enrollment: {e}"),
            Self::Param(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "config file i/o: {e}"),
            Self::Json(e) => write!(f, "config file json: {e}"),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Param(e) => Some(e),
            Self::Cooperative(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParamError> for FleetError {
    fn from(e: ParamError) -> Self {
        Self::Param(e)
    }
}

impl From<cyclegate::GateError> for FleetError {
    fn from(e: cyclegate::GateError) -> Self {
        match e {
            cyclegate::GateError::ManagerEnrolled => Self::ManagerEnrolled,
            other => Self::Cooperative(other),
        }
    }
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
