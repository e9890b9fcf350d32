//! Values handling: deep merge and layered overrides

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::sensitive::Sensitive;

/// Configuration tree with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse a YAML document. An empty document yields an empty map.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue =
            serde_yaml::from_str(yaml).map_err(|e| CoreError::ValuesParse {
                message: e.to_string(),
            })?;

        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            other => Err(CoreError::ValuesParse {
                message: format!("expected a mapping at the document root, found {}", kind_of(&other)),
            }),
        }
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self(value))
    }

    /// Deep merge another Values into this one
    ///
    /// Maps merge recursively; anything else (scalars, lists, a map
    /// meeting a scalar) is replaced wholesale by the overlay.
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Layer `overlay` on top of chart defaults
    pub fn merge_with_defaults(defaults: &Values, overlay: &Values) -> Values {
        let mut result = defaults.clone();
        result.merge(overlay);
        result
    }

    /// Set a value by dotted key (`image.tag`, `nodeSelector.kubernetes\.io/hostname`)
    pub fn set(&mut self, key: &str, value: JsonValue) -> Result<()> {
        let segments = split_key(key);
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CoreError::InvalidOverride {
                message: format!("key '{}' contains an empty segment", key),
            });
        }
        set_nested(&mut self.0, key, &segments, value)
    }

    /// Get a value by dotted key
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        let segments = split_key(key);
        segments
            .iter()
            .try_fold(&self.0, |current, segment| current.get(segment.as_str()))
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    // =========================================================================
    // Subchart Value Scoping
    // =========================================================================

    /// Scope values for a subchart
    ///
    /// The subchart sees the values under its own key as root values, plus
    /// `global` unchanged.
    pub fn scope_for_subchart(&self, subchart_name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent_obj) = &self.0 {
            if let Some(global) = parent_obj.get("global") {
                scoped.insert("global".to_string(), global.clone());
            }

            if let Some(JsonValue::Object(subchart_obj)) = parent_obj.get(subchart_name) {
                for (k, v) in subchart_obj {
                    scoped.insert(k.clone(), v.clone());
                }
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Subchart defaults overlaid with the scoped parent values
    pub fn for_subchart(
        subchart_defaults: &Values,
        parent_values: &Values,
        subchart_name: &str,
    ) -> Values {
        let scoped = parent_values.scope_for_subchart(subchart_name);
        Values::merge_with_defaults(subchart_defaults, &scoped)
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "a map",
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Split a key into path segments
///
/// `.` separates segments; `\.` is a literal dot inside the current segment.
/// A backslash before anything else is kept as-is.
pub fn split_key(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

fn set_nested(
    value: &mut JsonValue,
    key: &str,
    segments: &[String],
    new_value: JsonValue,
) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        *value = new_value;
        return Ok(());
    };

    let mut current = value;
    for segment in parents {
        // null is treated as an absent key, matching `key:` with no value in YAML
        if current.is_null() {
            *current = JsonValue::Object(serde_json::Map::new());
        }
        let JsonValue::Object(map) = current else {
            return Err(CoreError::KeyConflict {
                key: key.to_string(),
                segment: segment.clone(),
            });
        };
        let entry = map
            .entry(segment.clone())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        if !entry.is_object() && !entry.is_null() {
            return Err(CoreError::KeyConflict {
                key: key.to_string(),
                segment: segment.clone(),
            });
        }
        current = entry;
    }

    if current.is_null() {
        *current = JsonValue::Object(serde_json::Map::new());
    }
    match current {
        JsonValue::Object(map) => {
            map.insert(last.clone(), new_value);
            Ok(())
        }
        _ => Err(CoreError::KeyConflict {
            key: key.to_string(),
            segment: parents.last().cloned().unwrap_or_default(),
        }),
    }
}

/// Coerce a command-line style string into a typed value
///
/// `true`/`false`/`null` and integers become typed; numbers with a leading
/// zero stay strings so identifiers like `0123` survive. JSON arrays and
/// objects are parsed when they are valid.
pub fn coerce_scalar(raw: &str) -> JsonValue {
    match raw {
        "true" => return JsonValue::Bool(true),
        "false" => return JsonValue::Bool(false),
        "null" => return JsonValue::Null,
        _ => {}
    }

    let leading_zero = raw.len() > 1 && raw.starts_with('0') && !raw.starts_with("0.");
    if !leading_zero {
        if let Ok(num) = raw.parse::<i64>() {
            return JsonValue::Number(num.into());
        }
        if let Ok(num) = raw.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(num) {
                return JsonValue::Number(n);
            }
        }
    }

    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(raw) {
            return parsed;
        }
    }

    JsonValue::String(raw.to_string())
}

/// Parse a list override
///
/// A JSON array is used as-is, keeping typed elements and embedded commas.
/// Anything else is split on commas, each element trimmed and kept as a string.
pub fn parse_list_value(raw: &str) -> Vec<JsonValue> {
    match serde_json::from_str::<Vec<JsonValue>>(raw) {
        Ok(items) => items,
        Err(_) => raw
            .split(',')
            .map(|item| JsonValue::String(item.trim().to_string()))
            .collect(),
    }
}

/// Parse --set arguments (key=value format)
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::InvalidOverride {
            message: format!("Invalid --set format: '{}'. Expected key=value", arg),
        })?;
        values.set(key, coerce_scalar(val))?;
    }

    Ok(values)
}

// =========================================================================
// Override entries
// =========================================================================

/// How a scalar override value is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Coerce booleans, numbers and null
    #[default]
    Auto,
    /// Keep the raw string
    String,
}

impl ValueType {
    fn apply(self, raw: &str) -> JsonValue {
        match self {
            Self::Auto => coerce_scalar(raw),
            Self::String => JsonValue::String(raw.to_string()),
        }
    }
}

/// A `set` override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetValue {
    pub name: String,
    pub value: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
}

impl SetValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            value_type: ValueType::Auto,
        }
    }
}

/// A `setSensitive` override; the value never appears in debug output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSensitiveValue {
    pub name: String,
    pub value: Sensitive<String>,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
}

impl SetSensitiveValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Sensitive::new(value.into()),
            value_type: ValueType::Auto,
        }
    }
}

/// A `setList` override holding a JSON array or a comma separated list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetListValue {
    pub name: String,
    pub value: String,
}

impl SetListValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Combines override sources into one configuration tree
///
/// Layers apply lowest to highest: YAML document, `set`, `setList`,
/// `setSensitive`. Within a layer later entries win.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValuesMerger<'a> {
    document: Option<&'a str>,
    set: &'a [SetValue],
    set_list: &'a [SetListValue],
    set_sensitive: &'a [SetSensitiveValue],
}

impl<'a> ValuesMerger<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, document: Option<&'a str>) -> Self {
        self.document = document;
        self
    }

    pub fn with_set(mut self, set: &'a [SetValue]) -> Self {
        self.set = set;
        self
    }

    pub fn with_set_list(mut self, set_list: &'a [SetListValue]) -> Self {
        self.set_list = set_list;
        self
    }

    pub fn with_set_sensitive(mut self, set_sensitive: &'a [SetSensitiveValue]) -> Self {
        self.set_sensitive = set_sensitive;
        self
    }

    /// Build the merged tree
    pub fn merge(&self) -> Result<Values> {
        let mut values = match self.document {
            Some(doc) => Values::from_yaml(doc)?,
            None => Values::new(),
        };

        for entry in self.set {
            values.set(&entry.name, entry.value_type.apply(&entry.value))?;
        }

        for entry in self.set_list {
            values.set(&entry.name, JsonValue::Array(parse_list_value(&entry.value)))?;
        }

        for entry in self.set_sensitive {
            values.set(&entry.name, entry.value_type.apply(entry.value.expose()))?;
        }

        Ok(values)
    }
}
