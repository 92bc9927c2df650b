//! The delivery plugin the host loads: scripts written in Rhai, one script
//! per plugin instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use delivery_plugin::{ConfigCategory, DeliveryPlugin, PluginError, PluginInformation, PluginType};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::{resolve_data_dir, scripts_dir};
use crate::error::DeliveryError;
use crate::gate::{ConfigGate, PluginState, SCRIPT_ITEM};
use crate::interpreter::InterpreterSession;
use crate::loader::ModuleLoader;
use crate::logger::DeliveryMetrics;

pub const PLUGIN_NAME: &str = "rhai";
pub const INTERFACE_VERSION: &str = "1.0.0";

/// The configuration the host offers before the user has picked a script.
pub fn default_config() -> Value {
    json!({
        "plugin": {
            "description": "Rhai notification delivery plugin",
            "type": "string",
            "default": PLUGIN_NAME,
            "readonly": "true"
        },
        "enable": {
            "description": "Enable Rhai delivery",
            "type": "boolean",
            "displayName": "Enabled",
            "default": "false"
        },
        "config": {
            "description": "Rhai plugin configuration.",
            "type": "JSON",
            "displayName": "Configuration",
            "order": "1",
            "default": "{}"
        },
        "script": {
            "description": "Rhai script to deliver notifications",
            "type": "script",
            "displayName": "Rhai Script",
            "order": "2",
            "default": ""
        }
    })
}

pub fn plugin_info() -> PluginInformation {
    PluginInformation {
        name: PLUGIN_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        options: 0,
        plugin_type: PluginType::NotificationDelivery,
        interface: INTERFACE_VERSION.to_string(),
        config: default_config(),
    }
}

#[derive(Debug)]
pub struct ScriptDeliveryPlugin {
    gate: ConfigGate,
    scripts_dir: PathBuf,
    metrics: DeliveryMetrics,
}

impl ScriptDeliveryPlugin {
    /// Build a plugin on an already started session, searching `scripts_dir`
    /// for modules. On failure the session is released.
    pub fn with_session(
        config: &ConfigCategory,
        session: InterpreterSession,
        scripts_dir: impl Into<PathBuf>,
    ) -> Result<Self, DeliveryError> {
        let scripts_dir = scripts_dir.into();
        session.add_search_path(&scripts_dir)?;

        let mut state = PluginState::from_category(config);
        if state.script_identifier().is_empty() {
            warn!(
                plugin = %state.name(),
                "started without a script, check the `{SCRIPT_ITEM}` item; delivery disabled"
            );
            state.disable_delivery();
        }

        let gate = ConfigGate::new(state, Arc::new(session), ModuleLoader::default());
        if !gate.configure() {
            let script = gate.script_identifier();
            gate.session().shutdown();
            return Err(DeliveryError::InitFailure(format!(
                "script `{script}` could not be loaded from {}",
                scripts_dir.display()
            )));
        }

        info!(
            plugin = %gate.name(),
            script = %gate.script_identifier(),
            enabled = gate.is_enabled(),
            owner = gate.session().is_owner(),
            "rhai delivery plugin started"
        );
        Ok(Self {
            gate,
            scripts_dir,
            metrics: DeliveryMetrics::default(),
        })
    }

    pub fn name(&self) -> String {
        self.gate.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    pub fn script_identifier(&self) -> String {
        self.gate.script_identifier()
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn gate(&self) -> &ConfigGate {
        &self.gate
    }

    /// Reload after the script file at `path` changed on disk, by replaying
    /// the current configuration. Files other than this plugin's script are
    /// ignored and yield `None`.
    pub fn reload_script(&self, path: &Path) -> Option<bool> {
        let leaf = path.file_name()?.to_str()?;
        let script = self.gate.script_identifier();
        if script.is_empty() || leaf != script {
            return None;
        }
        debug!(plugin = %self.gate.name(), script = %leaf, "script changed on disk, reloading");
        Some(self.gate.reconfigure(&self.gate.config_json()))
    }
}

impl DeliveryPlugin for ScriptDeliveryPlugin {
    fn info() -> PluginInformation {
        plugin_info()
    }

    fn init(config: &ConfigCategory) -> Result<Self, PluginError> {
        let scripts = scripts_dir(&resolve_data_dir());
        let session = InterpreterSession::ensure_started(config.name());
        Ok(Self::with_session(config, session, scripts)?)
    }

    #[instrument(level = "debug", skip(self, message), fields(plugin = %self.gate.name()))]
    fn deliver(&self, delivery_name: &str, notification_name: &str, trigger_reason: &str, message: &str) -> bool {
        if !self.gate.is_enabled() {
            debug!("delivery disabled, notification dropped");
            return false;
        }
        self.metrics
            .instrument_delivery(&self.gate.name(), notification_name, || self.gate.notify(message))
    }

    fn reconfigure(&self, new_config: &str) -> bool {
        self.gate.reconfigure(new_config)
    }

    fn shutdown(&self) {
        self.gate.release();
        self.gate.session().shutdown();
        debug!(plugin = %self.gate.name(), "rhai delivery plugin shut down");
    }
}

impl Drop for ScriptDeliveryPlugin {
    fn drop(&mut self) {
        self.gate.release();
    }
}
