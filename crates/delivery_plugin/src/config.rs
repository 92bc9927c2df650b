//! Configuration categories as the host hands them to a plugin.
//!
//! A category is a JSON object mapping item names to items:
//!
//! ```json
//! {
//!   "enable": { "type": "boolean", "default": "false", "value": "true" },
//!   "script": { "type": "script", "default": "", "file": "/data/scripts/alerts_script_deliver.rhai" }
//! }
//! ```
//!
//! Items carry a `value` and a `default`; reads fall back to the default when
//! no value has been set yet.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Value>,
    /// Path of the file backing a `script` item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Attributes that can be read off a single item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum ItemAttribute {
    Value,
    Default,
    Description,
    Type,
    DisplayName,
    Order,
    Readonly,
    File,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed configuration category: {0}")]
    Malformed(String),

    #[error("configuration item `{0}` not found")]
    ItemNotFound(String),

    #[error("attribute `{attribute}` not set on configuration item `{item}`")]
    AttributeNotFound { item: String, attribute: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> ConfigError {
        ConfigError::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigCategory {
    name: String,
    items: BTreeMap<String, ConfigItem>,
}

impl ConfigCategory {
    pub fn new(name: impl Into<String>, items: BTreeMap<String, ConfigItem>) -> Self {
        Self { name: name.into(), items }
    }

    /// Parse a category from the host's JSON representation.
    pub fn from_json(name: &str, json: &str) -> Result<Self, ConfigError> {
        let items: BTreeMap<String, ConfigItem> = serde_json::from_str(json)?;
        Ok(Self::new(name, items))
    }

    /// Build a category from a default-configuration template, copying every
    /// item's `default` into its `value`.
    pub fn with_defaults(name: &str, template: &Value) -> Result<Self, ConfigError> {
        let mut items: BTreeMap<String, ConfigItem> = serde_json::from_value(template.clone())?;
        for item in items.values_mut() {
            if item.value.is_none() {
                item.value = item.default.clone();
            }
        }
        Ok(Self::new(name, items))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn item_exists(&self, item: &str) -> bool {
        self.items.contains_key(item)
    }

    pub fn item(&self, item: &str) -> Option<&ConfigItem> {
        self.items.get(item)
    }

    pub fn items(&self) -> impl Iterator<Item = (&String, &ConfigItem)> {
        self.items.iter()
    }

    pub fn set_item(&mut self, name: impl Into<String>, item: ConfigItem) {
        self.items.insert(name.into(), item);
    }

    /// Current value of an item, falling back to its default.
    /// Non-string JSON values come back serialized.
    pub fn value(&self, item: &str) -> Option<String> {
        let item = self.items.get(item)?;
        item.value.as_ref().or(item.default.as_ref()).map(stringify)
    }

    pub fn item_attribute(&self, item: &str, attribute: ItemAttribute) -> Result<String, ConfigError> {
        let entry = self
            .items
            .get(item)
            .ok_or_else(|| ConfigError::ItemNotFound(item.to_string()))?;

        let found = match attribute {
            ItemAttribute::Value => entry.value.as_ref().map(stringify),
            ItemAttribute::Default => entry.default.as_ref().map(stringify),
            ItemAttribute::Description => entry.description.clone(),
            ItemAttribute::Type => entry.item_type.clone(),
            ItemAttribute::DisplayName => entry.display_name.clone(),
            ItemAttribute::Order => entry.order.as_ref().map(stringify),
            ItemAttribute::Readonly => entry.readonly.as_ref().map(stringify),
            ItemAttribute::File => entry.file.clone(),
        };

        found.ok_or_else(|| ConfigError::AttributeNotFound {
            item: item.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Serialize back into the host's JSON representation (items only).
    pub fn to_json(&self) -> String {
        // A map of plain data always serializes.
        serde_json::to_string(&self.items).unwrap_or_else(|_| "{}".to_string())
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConfigCategory {
        let json = json!({
            "enable": { "type": "boolean", "default": "false", "value": "True" },
            "config": { "type": "JSON", "default": "{}", "value": { "recipients": ["ops"] } },
            "script": {
                "type": "script",
                "default": "",
                "file": "/usr/local/data/scripts/alerts_script_deliver.rhai"
            },
            "order": { "type": "integer", "default": 3 }
        });
        ConfigCategory::from_json("alerts", &json.to_string()).unwrap()
    }

    #[test]
    fn values_fall_back_to_default() {
        let category = sample();
        assert_eq!(category.name(), "alerts");
        assert_eq!(category.value("enable").as_deref(), Some("True"));
        assert_eq!(category.value("script").as_deref(), Some(""));
        assert_eq!(category.value("order").as_deref(), Some("3"));
        assert_eq!(category.value("missing"), None);
    }

    #[test]
    fn nested_values_are_serialized() {
        let category = sample();
        let config: Value = serde_json::from_str(&category.value("config").unwrap()).unwrap();
        assert_eq!(config["recipients"][0], "ops");
    }

    #[test]
    fn file_attribute_lookup() {
        let category = sample();
        assert_eq!(
            category.item_attribute("script", ItemAttribute::File).unwrap(),
            "/usr/local/data/scripts/alerts_script_deliver.rhai"
        );
        assert_eq!(
            category.item_attribute("enable", ItemAttribute::File),
            Err(ConfigError::AttributeNotFound {
                item: "enable".into(),
                attribute: "file".into()
            })
        );
        assert_eq!(
            category.item_attribute("nope", ItemAttribute::Value),
            Err(ConfigError::ItemNotFound("nope".into()))
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            ConfigCategory::from_json("bad", "{ not json"),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            ConfigCategory::from_json("bad", "[1, 2]"),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn json_round_trips_through_the_host_format() {
        let category = sample();
        let again = ConfigCategory::from_json("alerts", &category.to_json()).unwrap();
        assert_eq!(category, again);
    }

    #[test]
    fn defaults_template_populates_values() {
        let template = json!({
            "enable": { "type": "boolean", "default": "false" },
            "script": { "type": "script", "default": "" }
        });
        let category = ConfigCategory::with_defaults("tpl", &template).unwrap();
        assert_eq!(
            category.item_attribute("enable", ItemAttribute::Value).unwrap(),
            "false"
        );
        assert!(category.item_exists("script"));
    }
}
