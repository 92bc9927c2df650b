use super::runtime::{ScriptFault, ScriptRuntime};

/// Shown when the runtime reports a failure without any description.
pub const NO_DESCRIPTION: &str = "no error description.";

/// Turns the runtime's pending error state into a message and clears it.
pub struct ErrorReporter;

impl ErrorReporter {
    /// Fetch and clear the pending error. Requires the global lock, which
    /// `&mut ScriptRuntime` proves. Never fails: an empty error state yields
    /// the placeholder.
    pub fn capture_and_clear(runtime: &mut ScriptRuntime) -> String {
        match runtime.take_error() {
            Some(fault) => Self::normalize(&fault),
            None => NO_DESCRIPTION.to_string(),
        }
    }

    /// `Kind: description [in source] [(line x, position y)]`
    pub fn normalize(fault: &ScriptFault) -> String {
        let description = fault
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(NO_DESCRIPTION);

        let mut text = format!("{}: {description}", fault.kind);
        if let Some(source) = &fault.source {
            text.push_str(&format!(" in `{source}`"));
        }
        if !fault.position.is_none() {
            text.push_str(&format!(" ({})", fault.position));
        }
        text
    }
}
