#![doc = "The `user_service` library crate."]
#![doc = ""]
#![doc = "This crate contains the tooling of the AutoHub user service: loading the local"]
#![doc = "`.env` file, assembling and running schema migrations for the `autohub` schema,"]
#![doc = "issuing and checking access tokens, and the diagnostic commands."]
#![doc = "It is used by the main binary (`main.rs`) to run one command per invocation."]

pub mod auth;
pub mod cli;
pub mod config;
pub mod env_file;
pub mod error;
pub mod migration;

pub use crate::config::EnvConfig;
pub use crate::env_file::{EnvFile, EnvLoad};
pub use crate::error::AppError;
