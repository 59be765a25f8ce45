use crate::config::{EnvConfig, DB_PASSWORD, DB_URL, DB_USERNAME};
use crate::error::AppError;
use lazy_static::lazy_static;
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use validator::{Validate, ValidationError};

/// Schema owned by the user service.
pub const SCHEMA: &str = "autohub";
/// Directory of versioned SQL scripts, relative to the project root.
pub const MIGRATION_LOCATION: &str = "db/migration";
/// Table recording applied migrations, created inside the default schema.
pub const HISTORY_TABLE: &str = "schema_history";
pub const BASELINE_VERSION: &str = "1";
pub const BASELINE_DESCRIPTION: &str = "<< Baseline >>";

const JDBC_PREFIX: &str = "jdbc:";
const REDACTED: &str = "******";

lazy_static! {
    static ref IDENTIFIER_REGEX: regex::Regex =
        regex::Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap();
}

/// Connection values and policy handed to the migration engine.
///
/// Connection values come from the `.env` file and may be absent; the policy
/// fields are fixed and do not depend on the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub baseline_on_migrate: bool,
    pub baseline_version: String,
    pub baseline_description: String,
    pub locations: Vec<String>,
    pub clean_disabled: bool,
    #[validate(custom = "validate_schema_names")]
    pub schemas: Vec<String>,
    #[validate(regex(
        path = "IDENTIFIER_REGEX",
        message = "Schema must be a lowercase SQL identifier"
    ))]
    pub default_schema: String,
    pub create_schemas: bool,
    #[validate(regex(
        path = "IDENTIFIER_REGEX",
        message = "Table must be a lowercase SQL identifier"
    ))]
    pub table: String,
    pub validate_on_migrate: bool,
}

fn validate_schema_names(schemas: &Vec<String>) -> Result<(), ValidationError> {
    if schemas.is_empty() {
        return Err(ValidationError::new("no_schemas"));
    }
    if schemas.iter().any(|s| !IDENTIFIER_REGEX.is_match(s)) {
        return Err(ValidationError::new("invalid_schema_name"));
    }
    Ok(())
}

impl MigrationSettings {
    /// Assembles settings from the loaded configuration.
    ///
    /// Missing `DB_URL`, `DB_USERNAME` or `DB_PASSWORD` are left as `None`; the
    /// engine reports them when it actually needs to connect.
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            url: config.get_owned(DB_URL),
            user: config.get_owned(DB_USERNAME),
            password: config.get_owned(DB_PASSWORD),
            baseline_on_migrate: true,
            baseline_version: BASELINE_VERSION.to_string(),
            baseline_description: BASELINE_DESCRIPTION.to_string(),
            locations: vec![MIGRATION_LOCATION.to_string()],
            clean_disabled: false,
            schemas: vec![SCHEMA.to_string()],
            default_schema: SCHEMA.to_string(),
            create_schemas: true,
            table: HISTORY_TABLE.to_string(),
            validate_on_migrate: true,
        }
    }

    /// Script directories resolved against the project root.
    pub fn script_dirs(&self, root: &Path) -> Vec<PathBuf> {
        self.locations.iter().map(|l| root.join(l)).collect()
    }

    /// Builds PostgreSQL connection options.
    ///
    /// Accepts JDBC style (`jdbc:postgresql://host:port/db`) and native
    /// `postgres://` URLs. `user` and `password`, when set, override any
    /// credentials embedded in the URL.
    pub fn connect_options(&self) -> Result<PgConnectOptions, AppError> {
        self.validate()?;
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::MissingSetting(DB_URL.to_string()))?;

        let mut options = PgConnectOptions::from_str(&normalize_url(url)).map_err(|e| {
            AppError::InvalidSetting(format!("{} is not a PostgreSQL URL: {}", DB_URL, e))
        })?;
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            options = options.username(user);
        }
        if let Some(password) = self.password.as_deref() {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Copy safe for display: the password is masked.
    pub fn redacted(&self) -> Self {
        Self {
            password: self.password.as_ref().map(|_| REDACTED.to_string()),
            ..self.clone()
        }
    }

    /// Human-readable summary used by `migrate-configure`.
    pub fn describe(&self) -> Vec<String> {
        let shown = self.redacted();
        let or_unset = |v: &Option<String>| v.clone().unwrap_or_else(|| "<unset>".to_string());
        vec![
            format!("url: {}", or_unset(&shown.url)),
            format!("user: {}", or_unset(&shown.user)),
            format!("password: {}", or_unset(&shown.password)),
            format!("baselineOnMigrate: {}", shown.baseline_on_migrate),
            format!("baselineVersion: {}", shown.baseline_version),
            format!("locations: {}", shown.locations.join(", ")),
            format!("cleanDisabled: {}", shown.clean_disabled),
            format!("schemas: {}", shown.schemas.join(", ")),
            format!("defaultSchema: {}", shown.default_schema),
            format!("createSchemas: {}", shown.create_schemas),
            format!("table: {}", shown.table),
            format!("validateOnMigrate: {}", shown.validate_on_migrate),
        ]
    }
}

/// Strips a `jdbc:` prefix; the remaining `postgresql://` URL is accepted by sqlx as is.
fn normalize_url(url: &str) -> String {
    url.trim()
        .strip_prefix(JDBC_PREFIX)
        .unwrap_or(url.trim())
        .to_string()
}
