//! Versioned SQL scripts on disk.
//!
//! Scripts are named `V<version>__<description>.sql`, for example
//! `V1_2__add_user_sessions.sql`. Version parts are separated by `.` or `_` and
//! compare numerically.

use crate::error::AppError;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

lazy_static! {
    static ref SCRIPT_NAME_REGEX: Regex =
        Regex::new(r"^V(\d+(?:[._]\d+)*)__([A-Za-z0-9_\- ]+)\.sql$").unwrap();
}

/// A dotted numeric migration version such as `1`, `1.2` or `2024.01.15`.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl FromStr for Version {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(|c| c == '.' || c == '_')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AppError::Migration(format!("Invalid migration version '{}'", s)))?;
        if parts.is_empty() {
            return Err(AppError::Migration("Empty migration version".into()));
        }
        Ok(Version(parts))
    }
}

/// Trailing zero parts are insignificant: `1` == `1.0`.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// A migration script read from a location directory.
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub version: Version,
    pub description: String,
    /// File name, recorded in the history table.
    pub script: String,
    pub path: PathBuf,
    pub sql: String,
    pub checksum: String,
}

impl MigrationScript {
    /// Builds a script from its file name and contents.
    pub fn from_parts(file_name: &str, path: PathBuf, sql: String) -> Result<Self, AppError> {
        let captures = SCRIPT_NAME_REGEX.captures(file_name).ok_or_else(|| {
            AppError::Migration(format!(
                "Invalid migration script name '{}', expected V<version>__<description>.sql",
                file_name
            ))
        })?;
        let version: Version = captures[1].parse()?;
        let description = captures[2].replace('_', " ");

        Ok(Self {
            version,
            description,
            script: file_name.to_string(),
            path,
            checksum: checksum(&sql),
            sql,
        })
    }
}

/// SHA-256 of the script with line endings normalized to `\n`, hex encoded.
pub fn checksum(sql: &str) -> String {
    let normalized = sql.replace("\r\n", "\n");
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lists the scripts of one location, sorted by version.
///
/// A missing directory has no scripts. Non-`.sql` files are ignored; `.sql`
/// files with a bad name or a repeated version are errors.
pub fn discover(dir: &Path) -> Result<Vec<MigrationScript>, AppError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Migration location {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(AppError::Io(format!(
                "Failed to read migration location {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let sql = fs::read_to_string(&path)?;
        scripts.push(MigrationScript::from_parts(&file_name, path, sql)?);
    }

    sort_unique(scripts)
}

/// Collects scripts from several locations into one version-ordered list.
pub fn discover_all(dirs: &[PathBuf]) -> Result<Vec<MigrationScript>, AppError> {
    let mut scripts = Vec::new();
    for dir in dirs {
        scripts.extend(discover(dir)?);
    }
    sort_unique(scripts)
}

fn sort_unique(mut scripts: Vec<MigrationScript>) -> Result<Vec<MigrationScript>, AppError> {
    scripts.sort_by(|a, b| a.version.cmp(&b.version));
    if let Some(pair) = scripts.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(AppError::Migration(format!(
            "Found more than one migration with version {}: {} and {}",
            pair[0].version, pair[0].script, pair[1].script
        )));
    }
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99"));
        assert_eq!(v("1"), v("1"));
        assert_eq!(v("1").cmp(&v("1.0")), Ordering::Equal);
        assert_eq!(v("1_2").to_string(), "1.2");
        assert!("1.a".parse::<Version>().is_err());
    }

    #[test]
    fn test_script_name_parsing() {
        let script = MigrationScript::from_parts(
            "V1_2__add_user_sessions.sql",
            PathBuf::from("V1_2__add_user_sessions.sql"),
            "SELECT 1;".into(),
        )
        .unwrap();
        assert_eq!(script.version, v("1.2"));
        assert_eq!(script.description, "add user sessions");

        assert!(MigrationScript::from_parts("create_users.sql", PathBuf::new(), String::new()).is_err());
        assert!(MigrationScript::from_parts("V1_create.sql", PathBuf::new(), String::new()).is_err());
    }

    #[test]
    fn test_checksum_ignores_line_endings() {
        assert_eq!(checksum("SELECT 1;\r\nSELECT 2;"), checksum("SELECT 1;\nSELECT 2;"));
        assert_ne!(checksum("SELECT 1;"), checksum("SELECT 2;"));
        assert_eq!(checksum("").len(), 64);
    }

    #[test]
    fn test_discover_sorts_and_filters() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("V10__ten.sql"), "SELECT 10;").unwrap();
        fs::write(dir.path().join("V2__two.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("V1__one.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let scripts = discover(dir.path()).unwrap();
        let versions: Vec<String> = scripts.iter().map(|s| s.version.to_string()).collect();
        assert_eq!(versions, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_discover_missing_directory() {
        let dir = TempDir::new().unwrap();
        assert!(discover(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_discover_rejects_duplicate_versions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("V1__one.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("V1.0__again.sql"), "SELECT 1;").unwrap();

        match discover(dir.path()) {
            Err(AppError::Migration(msg)) => assert!(msg.contains("more than one migration")),
            other => panic!("Unexpected result: {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_discover_rejects_badly_named_sql() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("create_users.sql"), "SELECT 1;").unwrap();
        assert!(discover(dir.path()).is_err());
    }
}
