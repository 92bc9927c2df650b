// delivery_plugin/src/plugin.rs
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::{ConfigCategory, ConfigError};

/// Which kind of plugin the host is loading.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PluginType {
    NotificationDelivery,
    NotificationRule,
}

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    /// `Critical` has no tracing counterpart and maps onto `error`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// The static description a plugin hands to the host before `init`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInformation {
    pub name: String,
    pub version: String,
    pub options: u32,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub interface: String,
    /// Default configuration category, item name → item.
    pub config: Value,
}

impl PluginInformation {
    /// The default configuration as a category the host can hand back to `init`.
    pub fn default_category(&self, name: &str) -> Result<ConfigCategory, ConfigError> {
        ConfigCategory::with_defaults(name, &self.config)
    }
}

/// The one trait delivery plugin authors implement.
///
/// The host drives a fixed sequence: `info`, `init`, any number of concurrent
/// `deliver` / `reconfigure` calls, then `shutdown`. Every method after `init`
/// takes `&self` because the host may call them from several threads at once.
pub trait DeliveryPlugin: Send + Sync + Sized {
    /// Metadata about this plugin.
    fn info() -> PluginInformation;

    /// Build a plugin instance from its configuration category.
    /// An error aborts the plugin load.
    fn init(config: &ConfigCategory) -> Result<Self, PluginError>;

    /// Deliver one notification. `false` means "delivery not confirmed",
    /// the host applies its own retry policy.
    fn deliver(
        &self,
        delivery_name: &str,
        notification_name: &str,
        trigger_reason: &str,
        message: &str,
    ) -> bool;

    /// Receive a new configuration category as JSON.
    fn reconfigure(&self, new_config: &str) -> bool;

    /// Release everything the plugin holds. Calling it twice is harmless.
    fn shutdown(&self);
}

/// Errors that a DeliveryPlugin implementation can return.
#[derive(Error, Debug, Serialize, Deserialize, JsonSchema)]
pub enum PluginError {
    /// The configuration category could not be used.
    #[error("configuration error: {0}")]
    Config(String),

    /// The plugin could not reach a usable state.
    #[error("plugin init failed: {0}")]
    Init(String),

    /// The plugin returned an unspecified failure.
    #[error("plugin error: {0}")]
    Other(String),
}

impl From<ConfigError> for PluginError {
    fn from(err: ConfigError) -> PluginError {
        PluginError::Config(err.to_string())
    }
}
