//! Configuration model and loader for vidforge: a TOML file plus
//! environment variable overrides. The interactive setup experience that
//! produces this file lives in the installer and is not this crate's
//! concern; this crate only loads and validates the result.

mod error;
mod loader;
mod settings;

pub use error::{ConfigError, Result};
pub use loader::load;
pub use settings::{RawSettings, RawSourceConfig, ResourceThresholds, Settings, SourceConfig};
