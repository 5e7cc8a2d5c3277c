//! Declarative plugin config schema: field descriptors, validation, default
//! filling, and sensitive-value masking. Section structs elsewhere in this
//! codebase declare their shape up front and fill in defaults on load; this
//! does the same thing data-driven instead of hardcoded per plugin, since
//! plugins are loaded dynamically rather than known at compile time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel written in place of a sensitive value whenever a schema-bound
/// config is rendered for display (logs, HTTP responses, CLI dumps).
pub const MASK_SENTINEL: &str = "***MASKED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Bool,
    Object,
    Array,
}

/// One field in a config schema. `object` and `array` kinds recurse via
/// `nested`; `array` additionally honors `min_items`/`max_items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConfigValue>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Vec<ConfigField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

impl ConfigField {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::String,
            required: false,
            default: None,
            sensitive: false,
            nested: None,
            pattern: None,
            min_items: None,
            max_items: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn default_value(mut self, value: ConfigValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// A config schema is an ordered list of top-level fields.
pub type ConfigSchema = Vec<ConfigField>;

/// A dynamically-typed config value. `Object` preserves insertion order via
/// `BTreeMap` keyed by field name (field names are unique within a schema,
/// so lexical ordering is an acceptable stand-in for declaration order in
/// rendered output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Bool(bool),
    Array(Vec<ConfigValue>),
    Object(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    fn kind(&self) -> FieldKind {
        match self {
            ConfigValue::String(_) => FieldKind::String,
            ConfigValue::Int(_) => FieldKind::Int,
            ConfigValue::Bool(_) => FieldKind::Bool,
            ConfigValue::Array(_) => FieldKind::Array,
            ConfigValue::Object(_) => FieldKind::Object,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("missing required field '{0}'")]
    MissingRequired(String),
    #[error("field '{field}' expected {expected:?}, got {got:?}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        got: FieldKind,
    },
    #[error("field '{field}' has {got} items, expected at least {min}")]
    TooFewItems { field: String, got: usize, min: usize },
    #[error("field '{field}' has {got} items, expected at most {max}")]
    TooManyItems { field: String, got: usize, max: usize },
    #[error("field '{field}' value does not match pattern '{pattern}'")]
    PatternMismatch { field: String, pattern: String },
    #[error("unknown field '{0}'")]
    UnknownField(String),
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Validate `value` (a top-level `Object`) against `schema`, recursing into
/// nested object/array-of-object fields. Does not fill defaults — call
/// `fill` first if partial configs should be accepted.
pub fn validate(schema: &ConfigSchema, value: &ConfigValue) -> Result<(), ConfigValidationError> {
    let ConfigValue::Object(map) = value else {
        return Err(ConfigValidationError::TypeMismatch {
            field: "<root>".into(),
            expected: FieldKind::Object,
            got: value.kind(),
        });
    };

    for field in schema {
        match map.get(&field.name) {
            None => {
                if field.required {
                    return Err(ConfigValidationError::MissingRequired(field.name.clone()));
                }
            }
            Some(v) => validate_field(field, v)?,
        }
    }

    Ok(())
}

fn validate_field(field: &ConfigField, value: &ConfigValue) -> Result<(), ConfigValidationError> {
    if value.kind() != field.kind {
        return Err(ConfigValidationError::TypeMismatch {
            field: field.name.clone(),
            expected: field.kind,
            got: value.kind(),
        });
    }

    match (&field.kind, value) {
        (FieldKind::Object, ConfigValue::Object(_)) => {
            if let Some(nested) = &field.nested {
                validate(nested, value)?;
            }
        }
        (FieldKind::Array, ConfigValue::Array(items)) => {
            if let Some(min) = field.min_items
                && items.len() < min
            {
                return Err(ConfigValidationError::TooFewItems {
                    field: field.name.clone(),
                    got: items.len(),
                    min,
                });
            }
            if let Some(max) = field.max_items
                && items.len() > max
            {
                return Err(ConfigValidationError::TooManyItems {
                    field: field.name.clone(),
                    got: items.len(),
                    max,
                });
            }
            if let Some(nested) = &field.nested {
                for item in items {
                    validate(nested, item)?;
                }
            }
        }
        (FieldKind::String, ConfigValue::String(s)) => {
            if let Some(pattern) = &field.pattern {
                let re = regex::Regex::new(pattern).map_err(|_| ConfigValidationError::PatternMismatch {
                    field: field.name.clone(),
                    pattern: pattern.clone(),
                })?;
                if !re.is_match(s) {
                    return Err(ConfigValidationError::PatternMismatch {
                        field: field.name.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// Fill in defaults for any field absent from `value`, recursing into
/// nested schemas. Idempotent: `fill(fill(c)) == fill(c)`.
pub fn fill(schema: &ConfigSchema, value: ConfigValue) -> ConfigValue {
    let mut map = match value {
        ConfigValue::Object(map) => map,
        _ => BTreeMap::new(),
    };

    for field in schema {
        let entry = map.remove(&field.name);
        let filled = match entry {
            Some(ConfigValue::Object(inner)) if field.kind == FieldKind::Object => {
                let nested_schema = field.nested.clone().unwrap_or_default();
                fill(&nested_schema, ConfigValue::Object(inner))
            }
            Some(ConfigValue::Array(items)) if field.kind == FieldKind::Array => {
                let nested_schema = field.nested.clone();
                ConfigValue::Array(
                    items
                        .into_iter()
                        .map(|item| match &nested_schema {
                            Some(s) => fill(s, item),
                            None => item,
                        })
                        .collect(),
                )
            }
            Some(other) => other,
            None => match &field.default {
                Some(default) => default.clone(),
                None if field.kind == FieldKind::Object => {
                    let nested_schema = field.nested.clone().unwrap_or_default();
                    fill(&nested_schema, ConfigValue::Object(BTreeMap::new()))
                }
                None => continue,
            },
        };
        map.insert(field.name.clone(), filled);
    }

    ConfigValue::Object(map)
}

/// Replace every sensitive field's value with [`MASK_SENTINEL`], recursing
/// into nested schemas. Used whenever a config is rendered for anything
/// other than the plugin instance that owns it.
pub fn mask(schema: &ConfigSchema, value: &ConfigValue) -> ConfigValue {
    let ConfigValue::Object(map) = value else {
        return value.clone();
    };

    let mut out = BTreeMap::new();
    for field in schema {
        let Some(v) = map.get(&field.name) else {
            continue;
        };
        let masked = if field.sensitive {
            ConfigValue::String(MASK_SENTINEL.to_string())
        } else {
            match (&field.nested, v) {
                (Some(nested), ConfigValue::Object(_)) => mask(nested, v),
                (Some(nested), ConfigValue::Array(items)) => {
                    ConfigValue::Array(items.iter().map(|item| mask(nested, item)).collect())
                }
                _ => v.clone(),
            }
        };
        out.insert(field.name.clone(), masked);
    }
    ConfigValue::Object(out)
}

/// Merge `update` over `current`, preserving `current`'s sensitive field
/// values wherever `update` carries the mask sentinel instead of a real
/// replacement (the convention for "unchanged" in a round-tripped config
/// edit: the caller echoes back whatever it read, sentinel included).
pub fn merge_preserving_sensitive(
    schema: &ConfigSchema,
    current: &ConfigValue,
    update: &ConfigValue,
) -> ConfigValue {
    let (ConfigValue::Object(current_map), ConfigValue::Object(update_map)) = (current, update) else {
        return update.clone();
    };

    let mut out = current_map.clone();
    for field in schema {
        let Some(new_value) = update_map.get(&field.name) else {
            continue;
        };
        if field.sensitive {
            if let ConfigValue::String(s) = new_value
                && (s.is_empty() || s == MASK_SENTINEL)
            {
                continue;
            }
            out.insert(field.name.clone(), new_value.clone());
            continue;
        }

        let merged = match (&field.nested, current_map.get(&field.name), new_value) {
            (Some(nested), Some(cur), _) if field.kind == FieldKind::Object => {
                merge_preserving_sensitive(nested, cur, new_value)
            }
            _ => new_value.clone(),
        };
        out.insert(field.name.clone(), merged);
    }
    ConfigValue::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_schema() -> ConfigSchema {
        vec![
            ConfigField::string("host").required(),
            ConfigField::string("token").sensitive(),
            ConfigField {
                name: "port".into(),
                kind: FieldKind::Int,
                required: false,
                default: Some(ConfigValue::Int(27015)),
                sensitive: false,
                nested: None,
                pattern: None,
                min_items: None,
                max_items: None,
            },
        ]
    }

    fn obj(pairs: &[(&str, ConfigValue)]) -> ConfigValue {
        ConfigValue::Object(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn missing_required_field_fails_validation() {
        let schema = sample_schema();
        let value = obj(&[]);
        assert_eq!(
            validate(&schema, &value),
            Err(ConfigValidationError::MissingRequired("host".into()))
        );
    }

    #[test]
    fn fill_is_idempotent() {
        let schema = sample_schema();
        let value = obj(&[("host", ConfigValue::String("127.0.0.1".into()))]);
        let once = fill(&schema, value);
        let twice = fill(&schema, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn fill_then_validate_satisfies_defaults() {
        let schema = sample_schema();
        let value = obj(&[("host", ConfigValue::String("127.0.0.1".into()))]);
        let filled = fill(&schema, value);
        assert!(validate(&schema, &filled).is_ok());
    }

    #[test]
    fn sensitive_fields_are_masked() {
        let schema = sample_schema();
        let value = obj(&[
            ("host", ConfigValue::String("h".into())),
            ("token", ConfigValue::String("super-secret".into())),
        ]);
        let masked = mask(&schema, &value);
        let ConfigValue::Object(map) = masked else {
            panic!("expected object");
        };
        assert_eq!(map["token"], ConfigValue::String(MASK_SENTINEL.into()));
        assert_eq!(map["host"], ConfigValue::String("h".into()));
    }

    #[test]
    fn merge_preserves_sensitive_value_when_update_echoes_mask() {
        let schema = sample_schema();
        let current = obj(&[
            ("host", ConfigValue::String("h".into())),
            ("token", ConfigValue::String("super-secret".into())),
        ]);
        let update = obj(&[
            ("host", ConfigValue::String("h2".into())),
            ("token", ConfigValue::String(MASK_SENTINEL.into())),
        ]);
        let merged = merge_preserving_sensitive(&schema, &current, &update);
        let ConfigValue::Object(map) = merged else {
            panic!("expected object");
        };
        assert_eq!(map["token"], ConfigValue::String("super-secret".into()));
        assert_eq!(map["host"], ConfigValue::String("h2".into()));
    }

    #[test]
    fn merge_applies_real_replacement_for_sensitive_field() {
        let schema = sample_schema();
        let current = obj(&[("token", ConfigValue::String("old".into()))]);
        let update = obj(&[("token", ConfigValue::String("new".into()))]);
        let merged = merge_preserving_sensitive(&schema, &current, &update);
        let ConfigValue::Object(map) = merged else {
            panic!("expected object");
        };
        assert_eq!(map["token"], ConfigValue::String("new".into()));
    }

    #[test]
    fn merge_preserves_sensitive_value_when_update_is_empty_string() {
        let schema = sample_schema();
        let current = obj(&[("token", ConfigValue::String("super-secret".into()))]);
        let update = obj(&[("token", ConfigValue::String(String::new()))]);
        let merged = merge_preserving_sensitive(&schema, &current, &update);
        let ConfigValue::Object(map) = merged else {
            panic!("expected object");
        };
        assert_eq!(map["token"], ConfigValue::String("super-secret".into()));
    }

    #[test]
    fn array_item_count_bounds_are_enforced() {
        let schema = vec![ConfigField {
            name: "tags".into(),
            kind: FieldKind::Array,
            required: false,
            default: None,
            sensitive: false,
            nested: None,
            pattern: None,
            min_items: Some(1),
            max_items: Some(2),
        }];
        let too_few = obj(&[("tags", ConfigValue::Array(vec![]))]);
        assert!(matches!(
            validate(&schema, &too_few),
            Err(ConfigValidationError::TooFewItems { .. })
        ));

        let too_many = obj(&[(
            "tags",
            ConfigValue::Array(vec![
                ConfigValue::String("a".into()),
                ConfigValue::String("b".into()),
                ConfigValue::String("c".into()),
            ]),
        )]);
        assert!(matches!(
            validate(&schema, &too_many),
            Err(ConfigValidationError::TooManyItems { .. })
        ));
    }
}
