//! App configurations: settings the app needs resolved, descriptive info, and
//! requested permissions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Resolved setting values keyed by field name.
pub type Settings = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Secret,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Secret => "secret",
        }
    }

    /// Whether an already-typed `value` fits this field.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Secret => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(FieldType::String),
            "number" => Some(FieldType::Number),
            "boolean" => Some(FieldType::Boolean),
            "secret" => Some(FieldType::Secret),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Transact,
    WriteFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "configType", rename_all = "lowercase")]
pub enum Configuration {
    Setting {
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(rename = "fieldType")]
        field_type: FieldType,
    },
    Info {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Permission { permission: Permission },
}

impl Configuration {
    pub fn setting(field_name: impl Into<String>, field_type: FieldType) -> Self {
        Configuration::Setting {
            field_name: field_name.into(),
            field_type,
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        Configuration::Info {
            description: Some(description.into()),
        }
    }

    pub fn permission(permission: Permission) -> Self {
        Configuration::Permission { permission }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingError {
    #[error("'{raw}' is not a valid {field_type} value")]
    Invalid { raw: String, field_type: FieldType },
}

/// Convert raw text input (e.g. from a prompt) into a typed setting value.
pub fn coerce_raw_setting(raw: &str, field_type: FieldType) -> Result<Value, SettingError> {
    match field_type {
        FieldType::Boolean => {
            let truthy = ["1", "true", "yes", "y"];
            Ok(Value::Bool(truthy.contains(&raw.trim().to_lowercase().as_str())))
        }
        FieldType::Number => {
            let trimmed = raw.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Ok(Value::Number(int.into()));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| SettingError::Invalid {
                    raw: raw.to_string(),
                    field_type,
                })
        }
        FieldType::String | FieldType::Secret => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn configurations_use_tagged_wire_shape() {
        let configs = vec![
            Configuration::setting("email", FieldType::String),
            Configuration::description("watches transfers"),
            Configuration::permission(Permission::WriteFile),
        ];
        assert_eq!(
            serde_json::to_value(&configs).unwrap(),
            json!([
                { "configType": "setting", "fieldName": "email", "fieldType": "string" },
                { "configType": "info", "description": "watches transfers" },
                { "configType": "permission", "permission": "write-file" }
            ])
        );
    }

    #[test]
    fn typed_values_match_field_types() {
        assert!(FieldType::Number.accepts(&json!(10)));
        assert!(!FieldType::Number.accepts(&json!("10")));
        assert!(FieldType::Secret.accepts(&json!("hunter2")));
        assert!(!FieldType::Boolean.accepts(&json!(1)));
    }

    #[test]
    fn coerces_raw_settings() {
        assert_eq!(coerce_raw_setting("Yes", FieldType::Boolean).unwrap(), json!(true));
        assert_eq!(coerce_raw_setting("nope", FieldType::Boolean).unwrap(), json!(false));
        assert_eq!(coerce_raw_setting(" 42 ", FieldType::Number).unwrap(), json!(42));
        assert_eq!(coerce_raw_setting("1.5", FieldType::Number).unwrap(), json!(1.5));
        assert!(coerce_raw_setting("abc", FieldType::Number).is_err());
        assert_eq!(coerce_raw_setting("hunter2", FieldType::Secret).unwrap(), json!("hunter2"));
    }
}
