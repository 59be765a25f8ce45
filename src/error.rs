//!
//! # Custom Error Handling
//!
//! This module defines the error type `AppError` shared by every operation of the
//! user-service tooling: loading the `.env` file, assembling migration settings,
//! running migrations against PostgreSQL and issuing or checking JWTs.
//!
//! `From` implementations for `std::io::Error`, `sqlx::Error`,
//! `validator::ValidationErrors` and `jsonwebtoken::errors::Error` let callers
//! propagate failures with the `?` operator.

use std::fmt;
use std::io;
use std::path::PathBuf;
use validator::ValidationErrors;

/// Represents all possible errors that can occur within the application.
#[derive(Debug)]
pub enum AppError {
    /// The `.env` file exists but a line could not be parsed.
    /// The whole load is rejected; no partial mapping is ever returned.
    EnvFileParse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    /// A required configuration key is absent from the `.env` file.
    MissingSetting(String),
    /// A configuration value is present but unusable.
    InvalidSetting(String),
    /// Reading a file or writing output failed.
    Io(String),
    /// Errors originating from database operations.
    /// Wraps errors from the `sqlx` crate.
    DatabaseError(String),
    /// Migration scripts or the schema history are inconsistent,
    /// or the requested migration action is not permitted.
    Migration(String),
    /// A token could not be created or did not verify.
    Token(String),
    /// Input failed validation.
    ValidationError(String),
    /// The command line could not be understood.
    Usage(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::EnvFileParse {
                path,
                line,
                message,
            } => write!(
                f,
                "Failed to parse {} at line {}: {}",
                path.display(),
                line,
                message
            ),
            AppError::MissingSetting(key) => write!(f, "Missing setting: {} is not set", key),
            AppError::InvalidSetting(msg) => write!(f, "Invalid setting: {}", msg),
            AppError::Io(msg) => write!(f, "I/O Error: {}", msg),
            AppError::DatabaseError(msg) => write!(f, "Database Error: {}", msg),
            AppError::Migration(msg) => write!(f, "Migration Error: {}", msg),
            AppError::Token(msg) => write!(f, "Token Error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            AppError::Usage(msg) => write!(f, "Usage: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Process exit code used by the binary when this error ends a command.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Usage(_) => 2,
            _ => 1,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(error: io::Error) -> AppError {
        AppError::Io(error.to_string())
    }
}

/// Converts `sqlx::Error` into `AppError::DatabaseError`.
///
/// Connection-level failures keep the driver's message so the operator can see
/// which host or credential was rejected.
impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> AppError {
        match error {
            sqlx::Error::Configuration(e) => {
                AppError::InvalidSetting(format!("database configuration: {}", e))
            }
            _ => AppError::DatabaseError(error.to_string()),
        }
    }
}

/// Converts `validator::ValidationErrors` into `AppError::ValidationError`.
///
/// The detailed validation messages are preserved.
impl From<ValidationErrors> for AppError {
    fn from(error: ValidationErrors) -> AppError {
        AppError::ValidationError(error.to_string())
    }
}

/// Converts `jsonwebtoken::errors::Error` into `AppError::Token`.
impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(error: jsonwebtoken::errors::Error) -> AppError {
        AppError::Token(error.to_string())
    }
}
