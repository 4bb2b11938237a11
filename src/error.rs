use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracehookError {
    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Consumer error: {message}")]
    Consumer { message: String },

    #[error("Tracing error: {message}")]
    Tracing { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for TracehookError {
    fn from(err: toml::de::Error) -> Self {
        TracehookError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for TracehookError {
    fn from(err: toml::ser::Error) -> Self {
        TracehookError::Config(format!("TOML serialization error: {}", err))
    }
}
