pub mod config;
pub mod plugin;

pub use config::{ConfigCategory, ConfigError, ConfigItem, ItemAttribute};
pub use plugin::{DeliveryPlugin, LogLevel, PluginError, PluginInformation, PluginType};
