use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for `{field}`: {value}")]
    InvalidDuration { field: String, value: String },

    #[error("invalid environment override {key}={value}: {reason}")]
    InvalidEnvOverride {
        key: String,
        value: String,
        reason: String,
    },

    #[error("at least one `[[sources]]` entry is required")]
    NoSources,

    #[error("source entry {index} is missing a `scratch` directory")]
    MissingScratch { index: usize },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
