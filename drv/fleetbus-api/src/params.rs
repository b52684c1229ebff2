// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named persistent parameters.
//!
//! A [`ParameterList`] is a flat, name-indexed set of typed values with
//! defaults: booleans, numbers, strings. Devices use one for their
//! persistent configuration (gear offsets, inversion flags, …), protocols
//! for their tunables (response timeout), the manager for its own knobs.
//!
//! The JSON form is a flat object, one key per parameter. Loading is
//! strict: a key that names no parameter, or whose JSON type does not match
//! the parameter's type, fails the whole load.

use indexmap::IndexMap;
use serde_json::{json, Value};

/// Which of the three parameter type families a name belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamKind {
    Bool,
    Number,
    Str,
}

impl core::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Number => write!(f, "number"),
            Self::Str => write!(f, "string"),
        }
    }
}

/// Structural parameter failures. None of these is retried.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParamError {
    /// A parameter with this name already exists (in any type family).
    DuplicateName(String),
    /// No parameter with this name exists in the addressed type family.
    UnknownName { name: String, kind: ParamKind },
    /// The JSON document to load was not an object.
    NotAnObject,
    /// A JSON value was neither bool, number, nor string.
    UnsupportedValue(String),
}

impl core::fmt::Display for ParamError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DuplicateName(name) => {
                write!(f, "parameter name already exists: {name}")
            }
            Self::UnknownName { name, kind } => {
                write!(f, "{kind} parameter does not exist: {name}")
            }
            Self::NotAnObject => {
                write!(f, "parameters json is not an object")
            }
            Self::UnsupportedValue(name) => {
                write!(f, "parameter json value is unsupported: {name}")
            }
        }
    }
}

impl std::error::Error for ParamError {}

/// One named value with its default.
#[derive(Clone, Debug)]
pub struct Parameter<T> {
    name: String,
    default: T,
    pub value: T,
}

impl<T: Clone> Parameter<T> {
    fn new(name: &str, default: T) -> Self {
        Self {
            name: name.to_string(),
            default: default.clone(),
            value: default,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> &T {
        &self.default
    }
}

/// Name-indexed parameter container with collision checks across all three
/// type families.
#[derive(Clone, Debug, Default)]
pub struct ParameterList {
    bools: IndexMap<String, Parameter<bool>>,
    numbers: IndexMap<String, Parameter<f64>>,
    strs: IndexMap<String, Parameter<String>>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any family holds a parameter with this name.
    pub fn exists(&self, name: &str) -> bool {
        self.bools.contains_key(name)
            || self.numbers.contains_key(name)
            || self.strs.contains_key(name)
    }

    fn check_new(&self, name: &str) -> Result<(), ParamError> {
        if self.exists(name) {
            return Err(ParamError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    pub fn add_bool(
        &mut self,
        name: &str,
        default: bool,
    ) -> Result<(), ParamError> {
        self.check_new(name)?;
        self.bools
            .insert(name.to_string(), Parameter::new(name, default));
        Ok(())
    }

    pub fn add_number(
        &mut self,
        name: &str,
        default: f64,
    ) -> Result<(), ParamError> {
        self.check_new(name)?;
        self.numbers
            .insert(name.to_string(), Parameter::new(name, default));
        Ok(())
    }

    pub fn add_str(
        &mut self,
        name: &str,
        default: &str,
    ) -> Result<(), ParamError> {
        self.check_new(name)?;
        self.strs.insert(
            name.to_string(),
            Parameter::new(name, default.to_string()),
        );
        Ok(())
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ParamError> {
        self.bools.get(name).map(|p| p.value).ok_or_else(|| {
            ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Bool,
            }
        })
    }

    pub fn get_number(&self, name: &str) -> Result<f64, ParamError> {
        self.numbers.get(name).map(|p| p.value).ok_or_else(|| {
            ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Number,
            }
        })
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ParamError> {
        self.strs.get(name).map(|p| p.value.as_str()).ok_or_else(|| {
            ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Str,
            }
        })
    }

    pub fn set_bool(
        &mut self,
        name: &str,
        value: bool,
    ) -> Result<(), ParamError> {
        match self.bools.get_mut(name) {
            Some(p) => {
                p.value = value;
                Ok(())
            }
            None => Err(ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Bool,
            }),
        }
    }

    pub fn set_number(
        &mut self,
        name: &str,
        value: f64,
    ) -> Result<(), ParamError> {
        match self.numbers.get_mut(name) {
            Some(p) => {
                p.value = value;
                Ok(())
            }
            None => Err(ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Number,
            }),
        }
    }

    pub fn set_str(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<(), ParamError> {
        match self.strs.get_mut(name) {
            Some(p) => {
                p.value = value.to_string();
                Ok(())
            }
            None => Err(ParamError::UnknownName {
                name: name.to_string(),
                kind: ParamKind::Str,
            }),
        }
    }

    /// Iteration over each family, in insertion order.
    pub fn bools(&self) -> impl Iterator<Item = &Parameter<bool>> {
        self.bools.values()
    }
    pub fn numbers(&self) -> impl Iterator<Item = &Parameter<f64>> {
        self.numbers.values()
    }
    pub fn strs(&self) -> impl Iterator<Item = &Parameter<String>> {
        self.strs.values()
    }

    /// Flat JSON object with one key per parameter.
    pub fn save_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for p in self.bools.values() {
            obj.insert(p.name.clone(), json!(p.value));
        }
        for p in self.numbers.values() {
            obj.insert(p.name.clone(), json!(p.value));
        }
        for p in self.strs.values() {
            obj.insert(p.name.clone(), json!(p.value));
        }
        Value::Object(obj)
    }

    /// Strict load from the flat JSON object form. `null` is accepted as
    /// "nothing to load". Every key must name an existing parameter of the
    /// matching type.
    pub fn load_json(&mut self, doc: &Value) -> Result<(), ParamError> {
        if doc.is_null() {
            return Ok(());
        }
        let obj = doc.as_object().ok_or(ParamError::NotAnObject)?;
        for (name, value) in obj {
            match value {
                Value::Bool(v) => self.set_bool(name, *v)?,
                Value::Number(v) => {
                    let v = v.as_f64().ok_or_else(|| {
                        ParamError::UnsupportedValue(name.clone())
                    })?;
                    self.set_number(name, v)?;
                }
                Value::String(v) => self.set_str(name, v)?,
                _ => {
                    return Err(ParamError::UnsupportedValue(name.clone()))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParameterList {
        let mut list = ParameterList::new();
        list.add_bool("inverse", false).unwrap();
        list.add_number("zero", 0.25).unwrap();
        list.add_str("label", "knee").unwrap();
        list
    }

    #[test]
    fn duplicate_names_rejected_across_families() {
        let mut list = sample();
        assert_eq!(
            list.add_number("inverse", 1.0),
            Err(ParamError::DuplicateName("inverse".to_string()))
        );
        assert_eq!(
            list.add_bool("label", true),
            Err(ParamError::DuplicateName("label".to_string()))
        );
    }

    #[test]
    fn typed_lookup() {
        let mut list = sample();
        assert_eq!(list.get_bool("inverse"), Ok(false));
        list.set_bool("inverse", true).unwrap();
        assert_eq!(list.get_bool("inverse"), Ok(true));

        // Right name, wrong family.
        assert_eq!(
            list.get_number("inverse"),
            Err(ParamError::UnknownName {
                name: "inverse".to_string(),
                kind: ParamKind::Number,
            })
        );
    }

    #[test]
    fn json_round_trip() {
        let mut list = sample();
        list.set_number("zero", -1.5).unwrap();
        list.set_str("label", "ankle").unwrap();

        let doc = list.save_json();
        let mut other = sample();
        other.load_json(&doc).unwrap();
        assert_eq!(other.get_number("zero"), Ok(-1.5));
        assert_eq!(other.get_str("label"), Ok("ankle"));
        assert_eq!(other.get_bool("inverse"), Ok(false));
    }

    #[test]
    fn load_rejects_unknown_key() {
        let mut list = sample();
        let doc = serde_json::json!({ "nope": 1.0 });
        assert_eq!(
            list.load_json(&doc),
            Err(ParamError::UnknownName {
                name: "nope".to_string(),
                kind: ParamKind::Number,
            })
        );
    }

    #[test]
    fn load_rejects_type_mismatch() {
        let mut list = sample();
        let doc = serde_json::json!({ "zero": true });
        assert_eq!(
            list.load_json(&doc),
            Err(ParamError::UnknownName {
                name: "zero".to_string(),
                kind: ParamKind::Bool,
            })
        );
    }

    #[test]
    fn load_rejects_non_object() {
        let mut list = sample();
        assert_eq!(
            list.load_json(&serde_json::json!([1, 2])),
            Err(ParamError::NotAnObject)
        );
        // null is explicitly fine: nothing to load.
        list.load_json(&Value::Null).unwrap();
    }

    #[test]
    fn defaults_are_kept() {
        let list = sample();
        let zero = list.numbers().find(|p| p.name() == "zero").unwrap();
        assert_eq!(*zero.default(), 0.25);
    }
}
