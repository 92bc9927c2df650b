pub mod config;
pub mod error;
pub mod gate;
pub mod interpreter;
pub mod invoker;
pub mod loader;
pub mod logger;
pub mod plugin;
pub mod schema;
pub mod watcher;

pub use error::DeliveryError;
pub use plugin::ScriptDeliveryPlugin;
