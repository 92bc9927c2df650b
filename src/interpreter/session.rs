//! Process-wide ownership of the script runtime.
//!
//! The first session to find the runtime stopped initializes it and becomes
//! its owner. Every session counts as a dependent; the runtime is finalized
//! once the owner has shut down and no dependent is left.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use super::runtime::ScriptRuntime;
use crate::error::DeliveryError;

/// The process-wide runtime host used by [`InterpreterSession::ensure_started`].
static GLOBAL_RUNTIME: Lazy<Arc<RuntimeHost>> = Lazy::new(|| Arc::new(RuntimeHost::new()));

#[derive(Debug, Default)]
struct Ownership {
    dependents: usize,
    owner_released: bool,
    epoch: u64,
}

/// One runtime plus the bookkeeping of who depends on it.
#[derive(Debug, Default)]
pub struct RuntimeHost {
    /// The global lock: every runtime access goes through this mutex.
    runtime: Mutex<Option<ScriptRuntime>>,
    /// Always taken before `runtime`, never while holding it.
    ownership: Mutex<Ownership>,
}

impl RuntimeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_runtime(&self) -> RuntimeGuard<'_> {
        let guard = self.runtime.lock().unwrap_or_else(|poisoned| {
            warn!("script runtime lock was poisoned by a panicking holder, recovering");
            poisoned.into_inner()
        });
        RuntimeGuard { guard }
    }

    fn lock_ownership(&self) -> MutexGuard<'_, Ownership> {
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_runtime().guard.is_some()
    }

    pub fn dependents(&self) -> usize {
        self.lock_ownership().dependents
    }
}

/// Holds the global lock. On release, any error state a caller left behind
/// is logged and cleared so the next holder starts clean.
struct RuntimeGuard<'a> {
    guard: MutexGuard<'a, Option<ScriptRuntime>>,
}

impl Drop for RuntimeGuard<'_> {
    fn drop(&mut self) {
        if let Some(runtime) = self.guard.as_mut() {
            if let Some(fault) = runtime.take_error() {
                warn!(?fault, "unreported script error cleared on lock release");
            }
        }
    }
}

/// A plugin instance's claim on the runtime.
#[derive(Debug)]
pub struct InterpreterSession {
    host: Arc<RuntimeHost>,
    owner: bool,
    released: AtomicBool,
}

impl InterpreterSession {
    /// Join the process-wide runtime, initializing it if nobody has yet.
    pub fn ensure_started(program: &str) -> Self {
        Self::start_on(Arc::clone(&GLOBAL_RUNTIME), program)
    }

    /// Start a private runtime that shares nothing with the process-wide one.
    pub fn isolated(program: &str) -> Self {
        Self::start_on(Arc::new(RuntimeHost::new()), program)
    }

    /// Join the runtime of an existing host.
    pub fn start_on(host: Arc<RuntimeHost>, program: &str) -> Self {
        let mut ownership = host.lock_ownership();

        let owner = {
            let mut runtime = host.lock_runtime();
            if runtime.guard.is_none() {
                ownership.epoch += 1;
                ownership.owner_released = false;
                *runtime.guard = Some(ScriptRuntime::new(program, ownership.epoch));
                true
            } else {
                false
            }
            // global lock released here
        };

        ownership.dependents += 1;
        if owner {
            info!(program, epoch = ownership.epoch, "script runtime initialized");
        } else {
            debug!(program, dependents = ownership.dependents, "joined running script runtime");
        }
        drop(ownership);

        Self {
            host,
            owner,
            released: AtomicBool::new(false),
        }
    }

    /// Whether this session performed the initialization.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_initialized(&self) -> bool {
        self.host.is_initialized()
    }

    pub fn host(&self) -> &Arc<RuntimeHost> {
        &self.host
    }

    /// Run `body` while holding the global lock. The lock is released on
    /// every exit path, unwinding included.
    pub fn with_lock<T>(
        &self,
        body: impl FnOnce(&mut ScriptRuntime) -> Result<T, DeliveryError>,
    ) -> Result<T, DeliveryError> {
        if self.released.load(Ordering::Acquire) {
            return Err(DeliveryError::RuntimeUnavailable);
        }
        let mut guard = self.host.lock_runtime();
        let runtime = guard.guard.as_mut().ok_or(DeliveryError::RuntimeUnavailable)?;
        body(runtime)
    }

    /// Add a scripts directory in front of the module search path.
    pub fn add_search_path(&self, dir: impl Into<PathBuf>) -> Result<(), DeliveryError> {
        let dir = dir.into();
        self.with_lock(|runtime| {
            runtime.insert_search_path(dir);
            Ok(())
        })
    }

    /// Release this session. The owner finalizes the runtime unless other
    /// sessions still depend on it, in which case the last of them does.
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut ownership = self.host.lock_ownership();
        ownership.dependents = ownership.dependents.saturating_sub(1);
        if self.owner {
            ownership.owner_released = true;
        }

        if ownership.owner_released && ownership.dependents == 0 {
            let finalized = self.host.lock_runtime().guard.take();
            if let Some(runtime) = finalized {
                runtime.finalize();
            }
            ownership.owner_released = false;
        } else if self.owner {
            debug!(dependents = ownership.dependents, "runtime owner released, finalization deferred");
        }
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
