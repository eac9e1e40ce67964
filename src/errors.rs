use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
}

impl AppError {
    /// File-level failures abort an upload before any geocoding starts.
    pub fn is_file_level(&self) -> bool {
        matches!(self, AppError::Parse(_) | AppError::Csv(_))
    }
}
