//! The embedded script runtime: session lifecycle, the runtime itself, and
//! error-state reporting.

pub mod error_reporter;
pub mod runtime;
pub mod session;

pub use error_reporter::ErrorReporter;
pub use runtime::{FaultKind, LoadedModule, Raised, ScriptFault, ScriptRuntime};
pub use session::{InterpreterSession, RuntimeHost};
