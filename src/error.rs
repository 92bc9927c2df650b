use delivery_plugin::{ConfigError, PluginError};
use thiserror::Error;

/// Everything that can go wrong between the host and a delivery script.
///
/// Script-side failures never escape as panics: they are captured from the
/// runtime's error state, cleared, and turned into one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// A reconfigure payload could not be parsed. Prior state is kept.
    #[error("malformed configuration: {0}")]
    ConfigMalformed(String),

    /// The script identifier does not encode an entry point.
    /// Not a failure: delivery is disabled for this plugin.
    #[error("script `{0}` does not name an entry point")]
    NamingConventionMismatch(String),

    #[error("cannot import script module `{module}`: {reason}")]
    ImportFailure { module: String, reason: String },

    #[error("cannot find entry point `{entry}` in script module `{module}`: {reason}")]
    EntryPointMissing {
        module: String,
        entry: String,
        reason: String,
    },

    /// The script raised while handling a delivery.
    #[error("script `{script}` failed: {reason}")]
    InvocationFailure { script: String, reason: String },

    /// The runtime has been finalized or this session was already released.
    #[error("script runtime is not available")]
    RuntimeUnavailable,

    #[error("plugin init failed: {0}")]
    InitFailure(String),
}

impl From<ConfigError> for DeliveryError {
    fn from(err: ConfigError) -> DeliveryError {
        DeliveryError::ConfigMalformed(err.to_string())
    }
}

impl From<DeliveryError> for PluginError {
    fn from(err: DeliveryError) -> PluginError {
        match err {
            DeliveryError::ConfigMalformed(msg) => PluginError::Config(msg),
            other => PluginError::Init(other.to_string()),
        }
    }
}
