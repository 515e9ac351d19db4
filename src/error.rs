use std::path::PathBuf;

/// Central error type for paneld.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("unknown control: {0}")]
    UnknownControl(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown action set: step {step} set {set}")]
    UnknownSet { step: String, set: String },

    #[error("invalid delay: {0}")]
    InvalidDelay(i64),

    #[error("invalid save mode: {0}")]
    InvalidSaveMode(String),

    #[error("not supported by control: {0}")]
    NotSupported(&'static str),

    #[error("invalid control record for {id}: {message}")]
    BadControlRecord { id: String, message: String },

    #[error("database error: {0}")]
    Db(String),

    #[error("instance error: {0}")]
    Instance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PanelError>;
