// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device registries.
//!
//! A [`TypedRegistry`] stores every device of one concrete model, indexed
//! by id and by name, along with the model's shared parameters, and owns
//! that model's slice of the persisted JSON document.
//!
//! The [`fleet_registry!`] macro unions typed registries into one aggregate
//! type implementing [`FleetRegistry`]: type-erased lookup by id/name
//! across all models, type-dispatched creation from scanned type numbers,
//! and the per-type-keyed JSON document. Typed access comes back through
//! [`TypedAccess`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use indexmap::IndexMap;
use serde_json::{json, Value};

use drv_fleetbus_api::{
    DeviceId, ParameterList, TypeNumber, DEVICE_ID_MAX, DEVICE_ID_MIN,
};

use crate::device::{DeviceModel, FleetDevice};
use crate::error::FleetError;
use crate::register::CallManager;

struct Inner<D> {
    by_name: IndexMap<String, Arc<D>>,
    by_id: std::collections::BTreeMap<DeviceId, Arc<D>>,
}

/// All devices of one concrete model.
pub struct TypedRegistry<D: DeviceModel> {
    parameters: Mutex<ParameterList>,
    inner: Mutex<Inner<D>>,
}

impl<D: DeviceModel> Default for TypedRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeviceModel> TypedRegistry<D> {
    pub fn new() -> Self {
        Self {
            parameters: Mutex::new(ParameterList::new()),
            inner: Mutex::new(Inner {
                by_name: IndexMap::new(),
                by_id: std::collections::BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared parameters of this device model.
    pub fn parameters(&self) -> MutexGuard<'_, ParameterList> {
        self.parameters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates, attaches, and initializes a device.
    pub fn add(
        &self,
        name: &str,
        id: DeviceId,
        manager: Weak<dyn CallManager>,
    ) -> Result<Arc<D>, FleetError> {
        if id.0 < DEVICE_ID_MIN || id.0 > DEVICE_ID_MAX {
            return Err(FleetError::UnknownDeviceId(id));
        }
        {
            let inner = self.lock();
            if inner.by_name.contains_key(name)
                || inner.by_id.contains_key(&id)
            {
                return Err(FleetError::DuplicateDevice {
                    name: name.to_string(),
                    id,
                });
            }
        }
        // Construct and initialize outside the registry lock: on_init
        // re-enters the manager through register declarations.
        let dev = D::new(name, id);
        dev.core().bind(manager);
        dev.on_init()?;

        let mut inner = self.lock();
        inner.by_name.insert(name.to_string(), Arc::clone(&dev));
        inner.by_id.insert(id, Arc::clone(&dev));
        Ok(dev)
    }

    pub fn exists_name(&self, name: &str) -> bool {
        self.lock().by_name.contains_key(name)
    }

    pub fn exists_id(&self, id: DeviceId) -> bool {
        self.lock().by_id.contains_key(&id)
    }

    pub fn get(&self, name: &str) -> Option<Arc<D>> {
        self.lock().by_name.get(name).cloned()
    }

    pub fn get_by_id(&self, id: DeviceId) -> Option<Arc<D>> {
        self.lock().by_id.get(&id).cloned()
    }

    /// Every device of this model, in id order.
    pub fn all(&self) -> Vec<Arc<D>> {
        self.lock().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    /// This model's section of the persisted document:
    /// `{ parameters, devices: [{id, name, parameters}] }`, devices in id
    /// order.
    pub fn save_json(&self) -> Value {
        let devices: Vec<Value> = self
            .all()
            .iter()
            .map(|dev| {
                json!({
                    "id": dev.core().id().0,
                    "name": dev.core().name(),
                    "parameters": dev.core().parameters().save_json(),
                })
            })
            .collect();
        json!({
            "parameters": self.parameters().save_json(),
            "devices": devices,
        })
    }

    /// Strict load of this model's section. Devices listed but not present
    /// are created; a listed id that exists under a different name fails.
    pub fn load_json(
        &self,
        doc: &Value,
        manager: &Weak<dyn CallManager>,
    ) -> Result<(), FleetError> {
        let obj = doc.as_object().ok_or_else(|| {
            FleetError::ConfigMalformed(format!(
                "{} section is not an object",
                D::TYPE_NAME
            ))
        })?;
        for key in obj.keys() {
            if key != "parameters" && key != "devices" {
                return Err(FleetError::ConfigMalformed(format!(
                    "unexpected key {key} in {} section",
                    D::TYPE_NAME
                )));
            }
        }

        if let Some(params) = obj.get("parameters") {
            self.parameters().load_json(params)?;
        }

        let Some(devices) = obj.get("devices") else {
            return Ok(());
        };
        let devices = devices.as_array().ok_or_else(|| {
            FleetError::ConfigMalformed(format!(
                "{} devices is not an array",
                D::TYPE_NAME
            ))
        })?;

        for entry in devices {
            let entry = entry.as_object().ok_or_else(|| {
                FleetError::ConfigMalformed(format!(
                    "{} device entry is not an object",
                    D::TYPE_NAME
                ))
            })?;
            for key in entry.keys() {
                if key != "id" && key != "name" && key != "parameters" {
                    return Err(FleetError::ConfigMalformed(format!(
                        "unexpected key {key} in {} device entry",
                        D::TYPE_NAME
                    )));
                }
            }
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|v| u8::try_from(v).ok())
                .map(DeviceId)
                .ok_or_else(|| {
                    FleetError::ConfigMalformed(format!(
                        "{} device entry has no valid id",
                        D::TYPE_NAME
                    ))
                })?;
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    FleetError::ConfigMalformed(format!(
                        "{} device entry has no valid name",
                        D::TYPE_NAME
                    ))
                })?;

            let dev = match self.get_by_id(id) {
                Some(dev) => {
                    if dev.core().name() != name {
                        return Err(FleetError::ConfigDeviceMismatch {
                            id,
                            name: name.to_string(),
                        });
                    }
                    dev
                }
                None => self.add(name, id, manager.clone())?,
            };
            if let Some(params) = entry.get("parameters") {
                dev.core().parameters().load_json(params)?;
            }
        }
        Ok(())
    }
}

/// Type-erased union of every supported device model.
///
/// Implemented by the struct the [`fleet_registry!`] macro generates; the
/// manager consumes it to iterate devices, dispatch scan-time creation,
/// and persist the device tree.
pub trait FleetRegistry: Send + Sync + 'static {
    /// `(type number, type name)` of every supported model.
    fn supported_types(&self) -> Vec<(TypeNumber, &'static str)>;

    fn is_supported(&self, type_number: TypeNumber) -> bool;

    fn type_name_of(&self, type_number: TypeNumber)
        -> Option<&'static str>;

    /// Creates a device of the model matching `type_number`. Fails with
    /// [`FleetError::UnsupportedType`] for unknown numbers and
    /// [`FleetError::DuplicateDevice`] if the id or name exists anywhere in
    /// the aggregate.
    fn create(
        &self,
        type_number: TypeNumber,
        name: &str,
        id: DeviceId,
        manager: Weak<dyn CallManager>,
    ) -> Result<Arc<dyn FleetDevice>, FleetError>;

    /// Every device of every model.
    fn devices(&self) -> Vec<Arc<dyn FleetDevice>>;

    fn device_by_id(&self, id: DeviceId) -> Option<Arc<dyn FleetDevice>>;

    fn device_by_name(&self, name: &str) -> Option<Arc<dyn FleetDevice>>;

    fn type_number_by_id(&self, id: DeviceId) -> Option<TypeNumber>;

    fn exists_id(&self, id: DeviceId) -> bool {
        self.device_by_id(id).is_some()
    }

    fn exists_name(&self, name: &str) -> bool {
        self.device_by_name(name).is_some()
    }

    /// The per-type-keyed document: `{ TypeName: {parameters, devices} }`.
    /// Every supported type appears, even when it holds no devices.
    fn save_json(&self) -> Value;

    /// Strict load of one top-level section; `key` must name a supported
    /// type.
    fn load_type_json(
        &self,
        key: &str,
        doc: &Value,
        manager: &Weak<dyn CallManager>,
    ) -> Result<(), FleetError>;
}

/// Typed window back into an aggregate registry.
pub trait TypedAccess<D: DeviceModel> {
    fn typed(&self) -> &TypedRegistry<D>;
}

/// Declares an aggregate registry over a list of device models.
///
/// ```ignore
/// fleet_registry! {
///     /// Registry of every shipped device model.
///     pub struct StandardRegistry {
///         rx64: Rx64,
///         mx64: Mx64,
///     }
/// }
/// ```
///
/// The generated struct holds one [`TypedRegistry`] per model, exposes each
/// through an accessor named after the field (and through
/// [`TypedAccess`]), and implements [`FleetRegistry`].
#[macro_export]
macro_rules! fleet_registry {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $field:ident : $ty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        pub struct $name {
            $( $field: $crate::TypedRegistry<$ty>, )+
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    $( $field: $crate::TypedRegistry::new(), )+
                }
            }

            $(
                pub fn $field(&self) -> &$crate::TypedRegistry<$ty> {
                    &self.$field
                }
            )+
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        $(
            impl $crate::TypedAccess<$ty> for $name {
                fn typed(&self) -> &$crate::TypedRegistry<$ty> {
                    &self.$field
                }
            }
        )+

        impl $crate::FleetRegistry for $name {
            fn supported_types(
                &self,
            ) -> ::std::vec::Vec<(
                ::drv_fleetbus_api::TypeNumber,
                &'static str,
            )> {
                ::std::vec![
                    $((
                        <$ty as $crate::DeviceModel>::TYPE_NUMBER,
                        <$ty as $crate::DeviceModel>::TYPE_NAME,
                    ),)+
                ]
            }

            fn is_supported(
                &self,
                type_number: ::drv_fleetbus_api::TypeNumber,
            ) -> bool {
                $( type_number == <$ty as $crate::DeviceModel>::TYPE_NUMBER ||)+
                false
            }

            fn type_name_of(
                &self,
                type_number: ::drv_fleetbus_api::TypeNumber,
            ) -> ::std::option::Option<&'static str> {
                $(
                    if type_number == <$ty as $crate::DeviceModel>::TYPE_NUMBER {
                        return ::std::option::Option::Some(
                            <$ty as $crate::DeviceModel>::TYPE_NAME,
                        );
                    }
                )+
                ::std::option::Option::None
            }

            fn create(
                &self,
                type_number: ::drv_fleetbus_api::TypeNumber,
                name: &str,
                id: ::drv_fleetbus_api::DeviceId,
                manager: ::std::sync::Weak<dyn $crate::CallManager>,
            ) -> ::std::result::Result<
                ::std::sync::Arc<dyn $crate::FleetDevice>,
                $crate::FleetError,
            > {
                use $crate::FleetRegistry as _;
                if self.exists_id(id) || self.exists_name(name) {
                    return ::std::result::Result::Err(
                        $crate::FleetError::DuplicateDevice {
                            name: name.to_string(),
                            id,
                        },
                    );
                }
                $(
                    if type_number == <$ty as $crate::DeviceModel>::TYPE_NUMBER {
                        let dev = self.$field.add(name, id, manager)?;
                        let dev: ::std::sync::Arc<dyn $crate::FleetDevice> =
                            dev;
                        return ::std::result::Result::Ok(dev);
                    }
                )+
                ::std::result::Result::Err(
                    $crate::FleetError::UnsupportedType(type_number),
                )
            }

            fn devices(
                &self,
            ) -> ::std::vec::Vec<::std::sync::Arc<dyn $crate::FleetDevice>> {
                let mut out: ::std::vec::Vec<
                    ::std::sync::Arc<dyn $crate::FleetDevice>,
                > = ::std::vec::Vec::new();
                $(
                    for dev in self.$field.all() {
                        let dev: ::std::sync::Arc<dyn $crate::FleetDevice> =
                            dev;
                        out.push(dev);
                    }
                )+
                out
            }

            fn device_by_id(
                &self,
                id: ::drv_fleetbus_api::DeviceId,
            ) -> ::std::option::Option<
                ::std::sync::Arc<dyn $crate::FleetDevice>,
            > {
                $(
                    if let ::std::option::Option::Some(dev) =
                        self.$field.get_by_id(id)
                    {
                        let dev: ::std::sync::Arc<dyn $crate::FleetDevice> =
                            dev;
                        return ::std::option::Option::Some(dev);
                    }
                )+
                ::std::option::Option::None
            }

            fn device_by_name(
                &self,
                name: &str,
            ) -> ::std::option::Option<
                ::std::sync::Arc<dyn $crate::FleetDevice>,
            > {
                $(
                    if let ::std::option::Option::Some(dev) =
                        self.$field.get(name)
                    {
                        let dev: ::std::sync::Arc<dyn $crate::FleetDevice> =
                            dev;
                        return ::std::option::Option::Some(dev);
                    }
                )+
                ::std::option::Option::None
            }

            fn type_number_by_id(
                &self,
                id: ::drv_fleetbus_api::DeviceId,
            ) -> ::std::option::Option<::drv_fleetbus_api::TypeNumber> {
                $(
                    if self.$field.exists_id(id) {
                        return ::std::option::Option::Some(
                            <$ty as $crate::DeviceModel>::TYPE_NUMBER,
                        );
                    }
                )+
                ::std::option::Option::None
            }

            fn save_json(&self) -> ::serde_json::Value {
                let mut doc = ::serde_json::Map::new();
                $(
                    doc.insert(
                        <$ty as $crate::DeviceModel>::TYPE_NAME.to_string(),
                        self.$field.save_json(),
                    );
                )+
                ::serde_json::Value::Object(doc)
            }

            fn load_type_json(
                &self,
                key: &str,
                doc: &::serde_json::Value,
                manager: &::std::sync::Weak<dyn $crate::CallManager>,
            ) -> ::std::result::Result<(), $crate::FleetError> {
                $(
                    if key == <$ty as $crate::DeviceModel>::TYPE_NAME {
                        return self.$field.load_json(doc, manager);
                    }
                )+
                ::std::result::Result::Err(
                    $crate::FleetError::UnknownConfigKey(key.to_string()),
                )
            }
        }
    };
}
