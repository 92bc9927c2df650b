use tracing::{debug, error};

use crate::error::DeliveryError;
use crate::interpreter::{ErrorReporter, InterpreterSession};
use crate::loader::BoundCallable;

/// Runs a bound entry point with the delivery message.
pub struct Invoker;

impl Invoker {
    /// Call `callable` with `message` under the global lock.
    /// Any returned value counts as success and is dropped straight away.
    pub fn call(session: &InterpreterSession, callable: &BoundCallable, message: &str) -> Result<(), DeliveryError> {
        session.with_lock(|runtime| match runtime.call(callable.module(), callable.entry(), message) {
            Ok(value) => {
                debug!(entry = callable.entry(), returned = value.type_name(), "script call returned");
                Ok(())
            }
            Err(_) => Err(DeliveryError::InvocationFailure {
                script: callable.module().name().to_string(),
                reason: ErrorReporter::capture_and_clear(runtime),
            }),
        })
    }

    /// [`Invoker::call`] flattened to the host's boolean outcome, logging failures.
    pub fn deliver(session: &InterpreterSession, plugin: &str, callable: &BoundCallable, message: &str) -> bool {
        match Self::call(session, callable, message) {
            Ok(()) => true,
            Err(err) => {
                error!(plugin, entry = callable.entry(), "delivery script error: {err}");
                false
            }
        }
    }
}
