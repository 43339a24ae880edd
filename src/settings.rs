// settings.rs

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("setting not found: {category}/{name}")]
    NotFound { category: String, name: String },
    #[error("type mismatch for setting {name}: stored {stored}, requested {requested}")]
    TypeMismatch {
        name: String,
        stored: SettingKind,
        requested: SettingKind,
    },
    #[error("category not found: {0}")]
    UnknownCategory(String),
    #[error("cannot parse {input:?} as {kind}")]
    Parse { input: String, kind: SettingKind },
    #[error("{category}/{name}: saved settings would exceed {capacity} bytes")]
    NoSpace {
        category: String,
        name: String,
        capacity: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    U8,
    I16,
    U16,
    I32,
    F32,
    Text,
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettingKind::Bool => "bool",
            SettingKind::U8 => "u8",
            SettingKind::I16 => "i16",
            SettingKind::U16 => "u16",
            SettingKind::I32 => "i32",
            SettingKind::F32 => "f32",
            SettingKind::Text => "text",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    F32(f32),
    Text(String),
}

impl SettingValue {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::U8(_) => SettingKind::U8,
            SettingValue::I16(_) => SettingKind::I16,
            SettingValue::U16(_) => SettingKind::U16,
            SettingValue::I32(_) => SettingKind::I32,
            SettingValue::F32(_) => SettingKind::F32,
            SettingValue::Text(_) => SettingKind::Text,
        }
    }

    /// Parses operator input (e.g. an MQTT payload) into a value of `kind`.
    pub fn parse_as(kind: SettingKind, input: &str) -> Result<Self, SettingsError> {
        let s = input.trim();
        let err = || SettingsError::Parse {
            input: input.to_string(),
            kind,
        };
        Ok(match kind {
            SettingKind::Bool => match s.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => SettingValue::Bool(true),
                "0" | "false" | "off" | "no" => SettingValue::Bool(false),
                _ => return Err(err()),
            },
            SettingKind::U8 => SettingValue::U8(s.parse().map_err(|_| err())?),
            SettingKind::I16 => SettingValue::I16(s.parse().map_err(|_| err())?),
            SettingKind::U16 => SettingValue::U16(s.parse().map_err(|_| err())?),
            SettingKind::I32 => SettingValue::I32(s.parse().map_err(|_| err())?),
            SettingKind::F32 => SettingValue::F32(s.parse().map_err(|_| err())?),
            // text is taken verbatim, including surrounding whitespace
            SettingKind::Text => SettingValue::Text(input.to_string()),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            SettingValue::Bool(v) => Value::from(*v),
            SettingValue::U8(v) => Value::from(*v),
            SettingValue::I16(v) => Value::from(*v),
            SettingValue::U16(v) => Value::from(*v),
            SettingValue::I32(v) => Value::from(*v),
            SettingValue::F32(v) => Value::from(*v),
            SettingValue::Text(v) => Value::from(v.as_str()),
        }
    }

    /// Reads a stored JSON value as `kind`. Out-of-range numbers and values
    /// of another JSON type yield `None`.
    pub fn from_json(kind: SettingKind, json: &Value) -> Option<Self> {
        match kind {
            SettingKind::Bool => json.as_bool().map(SettingValue::Bool),
            SettingKind::U8 => json
                .as_u64()
                .and_then(|v| u8::try_from(v).ok())
                .map(SettingValue::U8),
            SettingKind::I16 => json
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(SettingValue::I16),
            SettingKind::U16 => json
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(SettingValue::U16),
            SettingKind::I32 => json
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(SettingValue::I32),
            SettingKind::F32 => json.as_f64().map(|v| SettingValue::F32(v as f32)),
            SettingKind::Text => json.as_str().map(|v| SettingValue::Text(v.to_string())),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{}", u8::from(*v)),
            SettingValue::U8(v) => write!(f, "{v}"),
            SettingValue::I16(v) => write!(f, "{v}"),
            SettingValue::U16(v) => write!(f, "{v}"),
            SettingValue::I32(v) => write!(f, "{v}"),
            SettingValue::F32(v) => write!(f, "{v}"),
            SettingValue::Text(v) => f.write_str(v),
        }
    }
}

/// Rust types that can be stored in a [`Setting`].
pub trait SettingType: Sized {
    const KIND: SettingKind;
    fn from_value(value: &SettingValue) -> Option<Self>;
    fn into_value(self) -> SettingValue;
}

macro_rules! setting_type {
    ($t:ty, $variant:ident) => {
        impl SettingType for $t {
            const KIND: SettingKind = SettingKind::$variant;

            fn from_value(value: &SettingValue) -> Option<Self> {
                match value {
                    SettingValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn into_value(self) -> SettingValue {
                SettingValue::$variant(self)
            }
        }
    };
}

setting_type!(bool, Bool);
setting_type!(u8, U8);
setting_type!(i16, I16);
setting_type!(u16, U16);
setting_type!(i32, I32);
setting_type!(f32, F32);
setting_type!(String, Text);

/// Character limit of a text setting created without an explicit one.
pub const DEFAULT_TEXT_LEN: usize = 32;

/// A single typed value with a dirty flag. New settings start dirty.
#[derive(Clone, Debug)]
pub struct Setting {
    value: SettingValue,
    max_len: usize,
    dirty: bool,
}

impl Setting {
    pub fn new(default: impl SettingType) -> Self {
        let value = default.into_value();
        let max_len = match &value {
            SettingValue::Text(s) => s.chars().count().max(DEFAULT_TEXT_LEN),
            v => scalar_size(v.kind()),
        };
        Self {
            value,
            max_len,
            dirty: true,
        }
    }

    /// A text setting holding at most `max_len` characters.
    pub fn text(default: &str, max_len: usize) -> Self {
        Self {
            value: SettingValue::Text(truncate(default, max_len)),
            max_len,
            dirty: true,
        }
    }

    pub fn value(&self) -> &SettingValue {
        &self.value
    }

    pub fn kind(&self) -> SettingKind {
        self.value.kind()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Replaces the value, keeping the kind. Only a real change marks the
    /// setting dirty.
    pub fn set_value(&mut self, value: SettingValue) -> Result<(), SettingKind> {
        if value.kind() != self.kind() {
            return Err(value.kind());
        }
        let value = match value {
            SettingValue::Text(s) => SettingValue::Text(truncate(&s, self.max_len)),
            v => v,
        };
        if value != self.value {
            self.value = value;
            self.dirty = true;
        }
        Ok(())
    }

    /// Bytes this setting occupies in a fixed layout (text gets a terminator).
    pub fn size(&self) -> usize {
        match self.kind() {
            SettingKind::Text => self.max_len + 1,
            k => scalar_size(k),
        }
    }

    pub fn value_as_string(&self) -> String {
        self.value.to_string()
    }

    fn load_json(&mut self, json: &Value) {
        if let Some(v) = SettingValue::from_json(self.kind(), json) {
            // set_value() cannot fail here, the kind is the same
            let _ = self.set_value(v);
            self.dirty = false;
        }
    }
}

fn scalar_size(kind: SettingKind) -> usize {
    match kind {
        SettingKind::Bool | SettingKind::U8 => 1,
        SettingKind::I16 | SettingKind::U16 => 2,
        SettingKind::I32 | SettingKind::F32 => 4,
        SettingKind::Text => 0,
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    s.chars().take(max_len).collect()
}

/// A named group of settings, one category per module.
#[derive(Clone, Debug, Default)]
pub struct SettingsCategory {
    name: String,
    settings: BTreeMap<String, Setting>,
}

impl SettingsCategory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            settings: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a setting. Registering an existing name replaces it.
    pub fn add(&mut self, name: &str, setting: Setting) -> &mut Self {
        self.settings.insert(name.to_string(), setting);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.settings.contains_key(name)
    }

    pub fn setting(&self, name: &str) -> Option<&Setting> {
        self.settings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.settings.keys().map(String::as_str)
    }

    pub fn get<T: SettingType>(&self, name: &str) -> Result<T, SettingsError> {
        let setting = self.settings.get(name).ok_or_else(|| self.not_found(name))?;
        T::from_value(setting.value()).ok_or_else(|| SettingsError::TypeMismatch {
            name: name.to_string(),
            stored: setting.kind(),
            requested: T::KIND,
        })
    }

    pub fn set<T: SettingType>(&mut self, name: &str, value: T) -> Result<(), SettingsError> {
        self.set_value(name, value.into_value())
    }

    pub fn set_value(&mut self, name: &str, value: SettingValue) -> Result<(), SettingsError> {
        let not_found = self.not_found(name);
        let setting = self.settings.get_mut(name).ok_or(not_found)?;
        let stored = setting.kind();
        setting
            .set_value(value)
            .map_err(|requested| SettingsError::TypeMismatch {
                name: name.to_string(),
                stored,
                requested,
            })
    }

    pub fn is_dirty(&self) -> bool {
        self.settings.values().any(Setting::is_dirty)
    }

    pub fn mark_clean(&mut self) {
        self.settings.values_mut().for_each(Setting::mark_clean);
    }

    pub fn size(&self) -> usize {
        self.settings.values().map(Setting::size).sum()
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .settings
            .iter()
            .map(|(k, s)| (k.clone(), s.value().to_json()))
            .collect();
        Value::Object(map)
    }

    /// Applies stored values. Unknown keys are ignored, missing keys keep
    /// their current value.
    pub fn load_json(&mut self, json: &Map<String, Value>) {
        for (name, setting) in self.settings.iter_mut() {
            if let Some(v) = json.get(name) {
                setting.load_json(v);
            }
        }
    }

    fn not_found(&self, name: &str) -> SettingsError {
        SettingsError::NotFound {
            category: self.name.clone(),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan() -> SettingsCategory {
        let mut cat = SettingsCategory::new("FanPWM");
        cat.add("startSpeed", Setting::new(20i16))
            .add("maxRPM", Setting::new(4500i32))
            .add("label", Setting::text("Fan Controller", 8));
        cat
    }

    #[test]
    fn new_settings_are_dirty() {
        let s = Setting::new(5u8);
        assert!(s.is_dirty());
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn same_value_keeps_clean() {
        let mut cat = fan();
        cat.mark_clean();
        cat.set("startSpeed", 20i16).unwrap();
        assert!(!cat.is_dirty());
        cat.set("startSpeed", 35i16).unwrap();
        assert!(cat.is_dirty());
        assert_eq!(cat.get::<i16>("startSpeed").unwrap(), 35);
    }

    #[test]
    fn text_without_limit_takes_longer_values() {
        let mut cat = SettingsCategory::new("Fan");
        cat.add("name", Setting::new(String::from("ab")));
        cat.set("name", String::from("abcdef")).unwrap();
        assert_eq!(cat.get::<String>("name").unwrap(), "abcdef");
        assert_eq!(cat.setting("name").unwrap().max_len(), DEFAULT_TEXT_LEN);
    }

    #[test]
    fn text_is_truncated() {
        let mut cat = fan();
        assert_eq!(cat.get::<String>("label").unwrap(), "Fan Cont");
        cat.set("label", "abcdefghijkl".to_string()).unwrap();
        assert_eq!(cat.get::<String>("label").unwrap(), "abcdefgh");
        assert_eq!(cat.setting("label").unwrap().size(), 9);
    }

    #[test]
    fn truncation_counts_characters() {
        let mut s = Setting::text("", 3);
        s.set_value(SettingValue::Text("äöåx".into())).unwrap();
        assert_eq!(s.value(), &SettingValue::Text("äöå".into()));
    }

    #[test]
    fn typed_errors() {
        let mut cat = fan();
        assert!(matches!(
            cat.get::<i32>("startSpeed"),
            Err(SettingsError::TypeMismatch { .. })
        ));
        assert!(matches!(
            cat.get::<i32>("nope"),
            Err(SettingsError::NotFound { .. })
        ));
        assert!(matches!(
            cat.set("maxRPM", true),
            Err(SettingsError::TypeMismatch { .. })
        ));
        assert!(matches!(
            cat.set("nope", 1u8),
            Err(SettingsError::NotFound { .. })
        ));
    }

    #[test]
    fn json_load_ignores_unknown_and_wrong_types() {
        let mut cat = fan();
        let json = serde_json::json!({
            "startSpeed": 40,
            "maxRPM": "fast",
            "bogus": 1,
        });
        cat.load_json(json.as_object().unwrap());
        assert_eq!(cat.get::<i16>("startSpeed").unwrap(), 40);
        assert_eq!(cat.get::<i32>("maxRPM").unwrap(), 4500);
        assert!(!cat.setting("startSpeed").unwrap().is_dirty());
        // untouched by the load, still dirty from construction
        assert!(cat.setting("maxRPM").unwrap().is_dirty());
    }

    #[test]
    fn out_of_range_json_is_rejected() {
        assert_eq!(SettingValue::from_json(SettingKind::U8, &Value::from(300)), None);
        assert_eq!(
            SettingValue::from_json(SettingKind::U8, &Value::from(30)),
            Some(SettingValue::U8(30))
        );
    }

    #[test]
    fn parse_operator_input() {
        assert_eq!(
            SettingValue::parse_as(SettingKind::U16, " 1884 ").unwrap(),
            SettingValue::U16(1884)
        );
        assert_eq!(
            SettingValue::parse_as(SettingKind::Bool, "on").unwrap(),
            SettingValue::Bool(true)
        );
        assert!(SettingValue::parse_as(SettingKind::U8, "256").is_err());
        assert_eq!(
            SettingValue::parse_as(SettingKind::Text, " my net").unwrap(),
            SettingValue::Text(" my net".into())
        );
    }
}

// EOF
