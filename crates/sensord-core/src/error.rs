use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensordError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SensordError {
    /// Short error code string, stable across releases for log scraping.
    pub fn code(&self) -> &'static str {
        match self {
            SensordError::Config(_) => "CONFIG_ERROR",
            SensordError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SensordError>;
