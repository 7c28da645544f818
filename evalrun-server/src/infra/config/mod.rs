//! Service configuration: `.env`, an optional TOML file, and environment
//! overrides, composed into a [`Config`] plus non-fatal [`ConfigWarnings`].

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{CommandSpec, Config, ConfigMetadata, DatabaseConfig, EnvConfig, WorkerConfig};
pub use validation::{ConfigWarning, ConfigWarnings};
