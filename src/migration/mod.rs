//! Schema migrations for the `autohub` schema.
//!
//! `settings` turns the `.env` values into connection settings plus a fixed
//! policy, `script` reads the versioned SQL files, `history` decides what is
//! pending and `runner` talks to PostgreSQL.

pub mod history;
pub mod runner;
pub mod script;
pub mod settings;

pub use history::{AppliedMigration, MigrationInfo, MigrationState};
pub use runner::{clean, info, migrate, MigrationReport};
pub use script::{MigrationScript, Version};
pub use settings::MigrationSettings;
