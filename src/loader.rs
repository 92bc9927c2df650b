//! From a script identifier to a loaded module and a validated entry point.
//!
//! Script files are named `<prefix><marker><entry><extension>`, for example
//! `alerts_script_deliver.rhai`: the module is `alerts_script_deliver` and the
//! function called on delivery is `deliver`.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::DeliveryError;
use crate::interpreter::{ErrorReporter, LoadedModule, ScriptRuntime};
use crate::interpreter::runtime::SCRIPT_EXTENSION;

pub const DEFAULT_MARKER: &str = "_script_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    marker: String,
    extension: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER, format!(".{SCRIPT_EXTENSION}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub module_name: String,
    pub entry_name: String,
}

impl NamingConvention {
    pub fn new(marker: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            extension: extension.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Split an identifier into module and entry names.
    ///
    /// The identifier must end with the extension, contain the marker, and
    /// have something after the last marker; otherwise the script does not
    /// take part in delivery.
    pub fn derive_entry_point(&self, script_identifier: &str) -> Result<EntryPoint, DeliveryError> {
        let mismatch = || DeliveryError::NamingConventionMismatch(script_identifier.to_string());

        let module_name = script_identifier.strip_suffix(&self.extension).ok_or_else(mismatch)?;
        let marker_at = module_name.rfind(&self.marker).ok_or_else(mismatch)?;
        let entry_name = &module_name[marker_at + self.marker.len()..];
        if entry_name.is_empty() {
            return Err(mismatch());
        }

        Ok(EntryPoint {
            module_name: module_name.to_string(),
            entry_name: entry_name.to_string(),
        })
    }
}

/// Exclusive ownership of a loaded module. Dropping it releases the module.
#[derive(Debug)]
pub struct ModuleHandle {
    module: Arc<LoadedModule>,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn generation(&self) -> u64 {
        self.module.generation()
    }
}

/// A weak reference to an entry point inside a module handle.
/// It goes stale once the module it came from is reloaded and released.
#[derive(Debug, Clone)]
pub struct CallableHandle {
    module: Weak<LoadedModule>,
    entry: String,
}

impl CallableHandle {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Pin the module for one call. `None` once the module is gone.
    pub fn bind(&self) -> Option<BoundCallable> {
        self.module.upgrade().map(|module| BoundCallable {
            module,
            entry: self.entry.clone(),
        })
    }
}

/// A callable whose module version is pinned for the duration of a call.
#[derive(Debug, Clone)]
pub struct BoundCallable {
    module: Arc<LoadedModule>,
    entry: String,
}

impl BoundCallable {
    pub fn module(&self) -> &LoadedModule {
        &self.module
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleLoader {
    convention: NamingConvention,
}

impl ModuleLoader {
    pub fn new(convention: NamingConvention) -> Self {
        Self { convention }
    }

    pub fn convention(&self) -> &NamingConvention {
        &self.convention
    }

    pub fn derive_entry_point(&self, script_identifier: &str) -> Result<EntryPoint, DeliveryError> {
        self.convention.derive_entry_point(script_identifier)
    }

    pub fn load(&self, runtime: &mut ScriptRuntime, module_name: &str) -> Result<ModuleHandle, DeliveryError> {
        match runtime.import(module_name) {
            Ok(module) => {
                debug!(module = module_name, generation = module.generation(), "script module loaded");
                Ok(ModuleHandle { module })
            }
            Err(_) => Err(DeliveryError::ImportFailure {
                module: module_name.to_string(),
                reason: ErrorReporter::capture_and_clear(runtime),
            }),
        }
    }

    /// Re-execute the module behind `handle`. The old handle is consumed, so
    /// callables resolved from it go stale.
    pub fn reload(&self, runtime: &mut ScriptRuntime, handle: ModuleHandle) -> Result<ModuleHandle, DeliveryError> {
        match runtime.reload(&handle.module) {
            Ok(module) => {
                debug!(module = module.name(), generation = module.generation(), "script module reloaded");
                Ok(ModuleHandle { module })
            }
            Err(_) => Err(DeliveryError::ImportFailure {
                module: handle.name().to_string(),
                reason: ErrorReporter::capture_and_clear(runtime),
            }),
        }
    }

    pub fn resolve(
        &self,
        runtime: &mut ScriptRuntime,
        handle: &ModuleHandle,
        entry_name: &str,
    ) -> Result<CallableHandle, DeliveryError> {
        match runtime.lookup_function(&handle.module, entry_name) {
            Ok(()) => Ok(CallableHandle {
                module: Arc::downgrade(&handle.module),
                entry: entry_name.to_string(),
            }),
            Err(_) => Err(DeliveryError::EntryPointMissing {
                module: handle.name().to_string(),
                entry: entry_name.to_string(),
                reason: ErrorReporter::capture_and_clear(runtime),
            }),
        }
    }
}
