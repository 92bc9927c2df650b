//! ConfigGate: the single owner of a plugin's mutable state.
//!
//! Lock order is always config lock, then the runtime's global lock. The
//! global lock is never held while waiting for a config lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use delivery_plugin::{ConfigCategory, ItemAttribute};
use tracing::{debug, error, info, warn};

use crate::error::DeliveryError;
use crate::interpreter::InterpreterSession;
use crate::invoker::Invoker;
use crate::loader::{CallableHandle, ModuleHandle, ModuleLoader};

pub const ENABLE_ITEM: &str = "enable";
pub const SCRIPT_ITEM: &str = "script";

/// `Some(flag)` when the category has an `enable` item. Only "true" and
/// "True" enable.
pub fn enable_flag(category: &ConfigCategory) -> Option<bool> {
    category
        .value(ENABLE_ITEM)
        .map(|value| value == "true" || value == "True")
}

/// Leaf file name of the `script` item's file, or empty when there is none.
pub fn script_identifier(category: &ConfigCategory) -> String {
    if !category.item_exists(SCRIPT_ITEM) {
        return String::new();
    }
    match category.item_attribute(SCRIPT_ITEM, ItemAttribute::File) {
        Ok(file) => file.rsplit('/').next().unwrap_or_default().to_string(),
        Err(_) => String::new(),
    }
}

/// Everything a plugin instance knows about its script.
#[derive(Debug, Default)]
pub struct PluginState {
    name: String,
    enabled: bool,
    script_identifier: String,
    /// Last configuration payload accepted, replayed on hot reload.
    config_json: String,
    module: Option<ModuleHandle>,
    callable: Option<CallableHandle>,
}

impl PluginState {
    pub fn from_category(category: &ConfigCategory) -> Self {
        Self {
            name: category.name().to_string(),
            enabled: enable_flag(category).unwrap_or(false),
            script_identifier: script_identifier(category),
            config_json: category.to_json(),
            module: None,
            callable: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn script_identifier(&self) -> &str {
        &self.script_identifier
    }

    pub fn has_module(&self) -> bool {
        self.module.is_some()
    }

    pub fn has_callable(&self) -> bool {
        self.callable.is_some()
    }

    pub fn disable_delivery(&mut self) {
        self.enabled = false;
    }

    /// Drop the callable first: it must never outlive the module.
    fn clear_handles(&mut self) -> Option<ModuleHandle> {
        self.callable = None;
        self.module.take()
    }
}

/// What `notify` copies out before releasing the config lock.
#[derive(Debug)]
struct NotifySnapshot {
    name: String,
    script: String,
    callable: Option<crate::loader::BoundCallable>,
}

#[derive(Debug)]
pub struct ConfigGate {
    state: Mutex<PluginState>,
    session: Arc<InterpreterSession>,
    loader: ModuleLoader,
}

impl ConfigGate {
    pub fn new(state: PluginState, session: Arc<InterpreterSession>, loader: ModuleLoader) -> Self {
        Self {
            state: Mutex::new(state),
            session,
            loader,
        }
    }

    pub fn session(&self) -> &Arc<InterpreterSession> {
        &self.session
    }

    /// The config lock. Holding the guard is the precondition of [`ConfigGate::configure_locked`].
    pub fn lock(&self) -> MutexGuard<'_, PluginState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn script_identifier(&self) -> String {
        self.lock().script_identifier.clone()
    }

    pub fn config_json(&self) -> String {
        self.lock().config_json.clone()
    }

    /// Take the config lock and configure.
    pub fn configure(&self) -> bool {
        let mut state = self.lock();
        self.configure_locked(&mut state)
    }

    /// Import the script module and resolve its entry point.
    ///
    /// Returns `true` both on success and when the identifier does not follow
    /// the naming convention (delivery is then disabled). Returns `false` when
    /// the module or entry point cannot be loaded; `enabled` is left as it was.
    pub fn configure_locked(&self, state: &mut MutexGuard<'_, PluginState>) -> bool {
        let entry = match self.loader.derive_entry_point(&state.script_identifier) {
            Ok(entry) => entry,
            Err(err) => {
                info!(plugin = %state.name, "{err}, delivery disabled");
                state.disable_delivery();
                drop_module(&self.session, state.clear_handles());
                return true;
            }
        };

        debug!(
            plugin = %state.name,
            script = %entry.module_name,
            method = %entry.entry_name,
            "configuring delivery script"
        );

        let held = state.clear_handles();
        let outcome = self.session.with_lock(|runtime| {
            let module = match held {
                Some(module) if module.name() == entry.module_name => module,
                other => {
                    drop(other);
                    self.loader.load(runtime, &entry.module_name)?
                }
            };
            // On failure `module` is dropped here, under the lock.
            let callable = self.loader.resolve(runtime, &module, &entry.entry_name)?;
            Ok((module, callable))
        });

        match outcome {
            Ok((module, callable)) => {
                state.module = Some(module);
                state.callable = Some(callable);
                true
            }
            Err(err) => {
                error!(plugin = %state.name, "[CRITICAL] {err}");
                false
            }
        }
    }

    /// Apply a new configuration payload.
    ///
    /// The config lock is held for the whole transition so `notify` never
    /// sees a module without its matching callable.
    pub fn reconfigure(&self, payload: &str) -> bool {
        let category = match ConfigCategory::from_json("new", payload) {
            Ok(category) => category,
            Err(err) => {
                let err = DeliveryError::from(err);
                error!("{err}, keeping the current configuration");
                return false;
            }
        };

        let mut state = self.lock();
        debug!(plugin = %state.name, "reconfigure requested");

        // Stale callable goes first; the held module is re-executed in place.
        if let Some(module) = state.clear_handles() {
            let name = module.name().to_string();
            match self.session.with_lock(|runtime| self.loader.reload(runtime, module)) {
                Ok(reloaded) => state.module = Some(reloaded),
                Err(err) => warn!(plugin = %state.name, module = %name, "reload failed: {err}"),
            }
        }

        state.config_json = payload.to_string();
        if let Some(enabled) = enable_flag(&category) {
            state.enabled = enabled;
        }
        state.script_identifier = script_identifier(&category);

        if state.script_identifier.is_empty() {
            warn!(
                plugin = %state.name,
                "called without a script, check the `{SCRIPT_ITEM}` item; delivery disabled"
            );
            state.disable_delivery();
            drop_module(&self.session, state.clear_handles());
            return false;
        }

        self.configure_locked(&mut state)
    }

    /// Run the delivery script if the plugin is enabled.
    pub fn notify(&self, message: &str) -> bool {
        let snapshot = {
            let state = self.lock();
            if !state.enabled {
                return false;
            }
            NotifySnapshot {
                name: state.name.clone(),
                script: state.script_identifier.clone(),
                callable: state.callable.as_ref().and_then(CallableHandle::bind),
            }
            // config lock released here, before the script runs
        };

        let Some(callable) = snapshot.callable else {
            warn!(plugin = %snapshot.name, script = %snapshot.script, "enabled without a loaded entry point");
            return false;
        };

        let delivered = Invoker::deliver(&self.session, &snapshot.name, &callable, message);
        debug!(plugin = %snapshot.name, script = %snapshot.script, delivered, "delivery script called");
        delivered
    }

    /// Release both handles under the global lock.
    pub fn release(&self) {
        let mut state = self.lock();
        drop_module(&self.session, state.clear_handles());
    }
}

/// Module handles are released while holding the global lock. If the runtime
/// is already gone the handle is simply dropped.
fn drop_module(session: &InterpreterSession, module: Option<ModuleHandle>) {
    let Some(module) = module else {
        return;
    };
    let mut module = Some(module);
    if session
        .with_lock(|_| {
            drop(module.take());
            Ok(())
        })
        .is_err()
    {
        drop(module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn payload(file: &str, enable: &str) -> String {
        json!({
            "enable": { "type": "boolean", "default": "false", "value": enable },
            "config": { "type": "JSON", "default": "{}" },
            "script": { "type": "script", "default": "", "file": file }
        })
        .to_string()
    }

    fn gate_for(dir: &Path, file: &str, enable: &str) -> ConfigGate {
        let category = ConfigCategory::from_json("gate-test", &payload(file, enable)).unwrap();
        let session = Arc::new(InterpreterSession::isolated("gate-test"));
        session.add_search_path(dir).unwrap();
        ConfigGate::new(PluginState::from_category(&category), session, ModuleLoader::default())
    }

    fn write(dir: &Path, name: &str, source: &str) {
        fs::write(dir.join(name), source).unwrap();
    }

    #[test]
    fn enable_flag_accepts_true_and_capital_true() {
        for (value, expected) in [("true", true), ("True", true), ("TRUE", false), ("false", false)] {
            let category = ConfigCategory::from_json("c", &payload("x", value)).unwrap();
            assert_eq!(enable_flag(&category), Some(expected), "{value}");
        }
        let empty = ConfigCategory::from_json("c", "{}").unwrap();
        assert_eq!(enable_flag(&empty), None);
    }

    #[test]
    fn script_identifier_is_the_leaf_file_name() {
        let category = ConfigCategory::from_json("c", &payload("/data/scripts/a_script_b.rhai", "true")).unwrap();
        assert_eq!(script_identifier(&category), "a_script_b.rhai");

        let no_file = ConfigCategory::from_json("c", r#"{"script": {"type": "script"}}"#).unwrap();
        assert_eq!(script_identifier(&no_file), "");
    }

    #[test]
    fn configure_loads_and_notify_delivers() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "gate_script_deliver.rhai", "fn deliver(m) { true }");
        let gate = gate_for(dir.path(), "/x/gate_script_deliver.rhai", "true");

        assert!(gate.configure());
        {
            let state = gate.lock();
            assert!(state.has_module() && state.has_callable());
        }
        assert!(gate.notify("alert"));
    }

    #[test]
    fn naming_mismatch_disables_but_succeeds() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(dir.path(), "/x/notify35.rhai", "true");

        assert!(gate.configure());
        assert!(!gate.is_enabled());
        assert!(!gate.notify("alert"));
    }

    #[test]
    fn import_failure_keeps_handles_empty_and_enabled_untouched() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(dir.path(), "/x/missing_script_deliver.rhai", "true");

        assert!(!gate.configure());
        let state = gate.lock();
        assert!(!state.has_module());
        assert!(!state.has_callable());
        assert!(state.is_enabled());
    }

    #[test]
    fn enabled_without_callable_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let gate = gate_for(dir.path(), "/x/missing_script_deliver.rhai", "true");
        let _ = gate.configure();
        assert!(!gate.notify("alert"));
    }

    #[test]
    fn malformed_payload_keeps_prior_state() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "keep_script_deliver.rhai", "fn deliver(m) { true }");
        let gate = gate_for(dir.path(), "/x/keep_script_deliver.rhai", "true");
        assert!(gate.configure());

        assert!(!gate.reconfigure("{ definitely not json"));
        assert!(gate.is_enabled());
        assert_eq!(gate.script_identifier(), "keep_script_deliver.rhai");
        assert!(gate.notify("still here"));
    }

    #[test]
    fn reconfigure_without_script_disables() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "drop_script_deliver.rhai", "fn deliver(m) { true }");
        let gate = gate_for(dir.path(), "/x/drop_script_deliver.rhai", "true");
        assert!(gate.configure());

        let no_script = json!({ "enable": { "type": "boolean", "value": "true" } }).to_string();
        assert!(!gate.reconfigure(&no_script));
        assert!(!gate.is_enabled());
        assert!(!gate.lock().has_module());
        assert!(!gate.notify("nobody listens"));
    }

    #[test]
    fn reconfigure_picks_up_new_script_body() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "edit_script_deliver.rhai", r#"fn deliver(m) { throw "v1"; }"#);
        let gate = gate_for(dir.path(), "/x/edit_script_deliver.rhai", "true");
        assert!(gate.configure());
        assert!(!gate.notify("first"));

        write(dir.path(), "edit_script_deliver.rhai", "fn deliver(m) { true }");
        assert!(gate.reconfigure(&gate.config_json()));
        assert!(gate.notify("second"));
    }

    #[test]
    fn reconfigure_switches_to_another_script() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one_script_deliver.rhai", r#"fn deliver(m) { throw "one"; }"#);
        write(dir.path(), "two_script_send.rhai", "fn send(m) { true }");
        let gate = gate_for(dir.path(), "/x/one_script_deliver.rhai", "true");
        assert!(gate.configure());

        assert!(gate.reconfigure(&payload("/x/two_script_send.rhai", "true")));
        assert_eq!(gate.script_identifier(), "two_script_send.rhai");
        assert!(gate.notify("switched"));
    }

    #[test]
    fn reconfigure_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "same_script_deliver.rhai", "fn deliver(m) { true }");
        let gate = gate_for(dir.path(), "/x/same_script_deliver.rhai", "false");
        assert!(gate.configure());

        let next = payload("/x/same_script_deliver.rhai", "true");
        assert!(gate.reconfigure(&next));
        let first = (gate.is_enabled(), gate.script_identifier());
        assert!(gate.reconfigure(&next));
        assert_eq!(first, (gate.is_enabled(), gate.script_identifier()));
        assert_eq!(first, (true, "same_script_deliver.rhai".to_string()));
    }

    #[test]
    fn release_clears_both_handles() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "rel_script_deliver.rhai", "fn deliver(m) { true }");
        let gate = gate_for(dir.path(), "/x/rel_script_deliver.rhai", "true");
        assert!(gate.configure());

        gate.release();
        let state = gate.lock();
        assert!(!state.has_module() && !state.has_callable());
    }
}
