use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "configuration file not found. Looked for:\n\
        - the current directory: gridflow.local.yml, .gridflow.local.yml, gridflow.yml, .gridflow.yml\n\
        - the ./.gridflow/ directory\n\
        - ~/.config/gridflow/gridflow.yml\n\
        The GRIDFLOW_CONFIG_PATH environment variable selects a file directly"
    )]
    ConfigFileNotFound,

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
