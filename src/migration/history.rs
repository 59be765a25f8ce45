//! Schema history rows and the decision of what still has to run.

use crate::error::AppError;
use crate::migration::script::{MigrationScript, Version};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;

pub const KIND_SQL: &str = "SQL";
pub const KIND_BASELINE: &str = "BASELINE";

/// One row of the schema history table.
#[derive(Debug, Clone, FromRow)]
pub struct AppliedMigration {
    pub installed_rank: i32,
    pub version: String,
    pub description: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub script: String,
    pub checksum: Option<String>,
    pub installed_on: DateTime<Utc>,
    pub execution_time: i32,
    pub success: bool,
}

impl AppliedMigration {
    pub fn parsed_version(&self) -> Result<Version, AppError> {
        self.version.parse()
    }

    pub fn is_baseline(&self) -> bool {
        self.kind == KIND_BASELINE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Success,
    Baseline,
    Failed,
    Pending,
    BelowBaseline,
    /// Applied to the database but no longer present on disk.
    Missing,
    /// Present on disk, older than the current version and never applied.
    Ignored,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            MigrationState::Success => "Success",
            MigrationState::Baseline => "Baseline",
            MigrationState::Failed => "Failed",
            MigrationState::Pending => "Pending",
            MigrationState::BelowBaseline => "Below Baseline",
            MigrationState::Missing => "Missing",
            MigrationState::Ignored => "Ignored",
        };
        write!(f, "{}", label)
    }
}

/// A line of `info` output.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    pub version: String,
    pub description: String,
    pub state: MigrationState,
    pub installed_on: Option<DateTime<Utc>>,
}

impl fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let installed = self
            .installed_on
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        write!(
            f,
            "{:<10} | {:<40} | {:<14} | {}",
            self.version, self.description, self.state, installed
        )
    }
}

struct HistorySummary {
    current: Option<Version>,
    baseline: Option<Version>,
}

fn summarize(applied: &[AppliedMigration]) -> Result<HistorySummary, AppError> {
    let mut current: Option<Version> = None;
    let mut baseline: Option<Version> = None;
    for row in applied {
        let version = row.parsed_version()?;
        if row.is_baseline() && baseline.as_ref().map_or(true, |b| &version > b) {
            baseline = Some(version.clone());
        }
        if row.success && current.as_ref().map_or(true, |c| &version > c) {
            current = Some(version);
        }
    }
    Ok(HistorySummary { current, baseline })
}

/// Highest successfully applied (or baselined) version.
pub fn current_version(applied: &[AppliedMigration]) -> Result<Option<Version>, AppError> {
    Ok(summarize(applied)?.current)
}

fn is_applied(applied: &[AppliedMigration], version: &Version) -> Result<bool, AppError> {
    for row in applied {
        if &row.parsed_version()? == version {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Decides which scripts must run, in order.
///
/// Fails when a previous migration failed, when (with `validate`) an applied
/// script changed or disappeared, or when a script older than the current
/// version was never applied and is not covered by a baseline.
pub fn plan<'a>(
    applied: &[AppliedMigration],
    scripts: &'a [MigrationScript],
    validate: bool,
) -> Result<Vec<&'a MigrationScript>, AppError> {
    if let Some(failed) = applied.iter().find(|row| !row.success) {
        return Err(AppError::Migration(format!(
            "Detected failed migration to version {} ({}). Repair the schema history before migrating again",
            failed.version, failed.description
        )));
    }

    if validate {
        for row in applied.iter().filter(|row| !row.is_baseline()) {
            let version = row.parsed_version()?;
            let local = scripts.iter().find(|s| s.version == version).ok_or_else(|| {
                AppError::Migration(format!(
                    "Detected applied migration not resolved locally: {}",
                    row.version
                ))
            })?;
            if row.checksum.as_deref() != Some(local.checksum.as_str()) {
                return Err(AppError::Migration(format!(
                    "Migration checksum mismatch for migration version {} ({})",
                    row.version, local.script
                )));
            }
        }
    }

    let summary = summarize(applied)?;
    let mut pending = Vec::new();
    for script in scripts {
        if is_applied(applied, &script.version)? {
            continue;
        }
        if summary.baseline.as_ref().map_or(false, |b| &script.version <= b) {
            continue;
        }
        if summary.current.as_ref().map_or(false, |c| &script.version < c) {
            if validate {
                return Err(AppError::Migration(format!(
                    "Detected resolved migration not applied to database: {}",
                    script.version
                )));
            }
            continue;
        }
        pending.push(script);
    }
    Ok(pending)
}

/// Merges history rows and local scripts into a version-ordered report.
pub fn info(
    applied: &[AppliedMigration],
    scripts: &[MigrationScript],
) -> Result<Vec<MigrationInfo>, AppError> {
    let summary = summarize(applied)?;
    let mut rows: Vec<(Version, MigrationInfo)> = Vec::new();

    for row in applied {
        let version = row.parsed_version()?;
        let state = if !row.success {
            MigrationState::Failed
        } else if row.is_baseline() {
            MigrationState::Baseline
        } else if scripts.iter().any(|s| s.version == version) {
            MigrationState::Success
        } else {
            MigrationState::Missing
        };
        rows.push((
            version,
            MigrationInfo {
                version: row.version.clone(),
                description: row.description.clone(),
                state,
                installed_on: Some(row.installed_on),
            },
        ));
    }

    for script in scripts {
        if is_applied(applied, &script.version)? {
            continue;
        }
        let state = if summary.baseline.as_ref().map_or(false, |b| &script.version <= b) {
            MigrationState::BelowBaseline
        } else if summary.current.as_ref().map_or(false, |c| &script.version < c) {
            MigrationState::Ignored
        } else {
            MigrationState::Pending
        };
        rows.push((
            script.version.clone(),
            MigrationInfo {
                version: script.version.to_string(),
                description: script.description.clone(),
                state,
                installed_on: None,
            },
        ));
    }

    rows.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(rows.into_iter().map(|(_, info)| info).collect())
}
