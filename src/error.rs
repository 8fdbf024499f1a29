//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

pub type Result<T> = std::result::Result<T, Error>;
