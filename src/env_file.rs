//! Loading of the local `.env` file.
//!
//! The file is a minimal properties-style list of `KEY=VALUE` lines. It supplies
//! database credentials and token settings, so a malformed file is rejected as a
//! whole instead of being loaded partially.

use crate::error::AppError;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the environment file looked up in the project root.
pub const ENV_FILE_NAME: &str = ".env";

lazy_static! {
    // Keys: letters, digits, underscores, dots and hyphens; must not start with a digit.
    static ref KEY_REGEX: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap();
}

/// The parsed key/value mapping of an environment file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    /// Parses the text of an environment file.
    ///
    /// Blank lines and lines starting with `#` or `!` are skipped. Every other line
    /// must be `KEY=VALUE`; the line is split at the first `=` and both sides are
    /// trimmed. Values are kept verbatim (no unquoting, escapes or expansion).
    /// When a key repeats, the last value wins.
    ///
    /// The returned error carries the 1-based line number; use [`EnvFile::parse_file`]
    /// to also attach the file path.
    pub fn parse(text: &str) -> Result<EnvFile, (usize, String)> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut vars = BTreeMap::new();

        for (index, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw).trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| (index + 1, "expected KEY=VALUE".to_string()))?;
            let key = key.trim();
            if !KEY_REGEX.is_match(key) {
                return Err((index + 1, format!("invalid key '{}'", key)));
            }

            vars.insert(key.to_string(), value.trim().to_string());
        }

        Ok(EnvFile { vars })
    }

    /// Parses `text` read from `path`, mapping failures to [`AppError::EnvFileParse`].
    pub fn parse_file(path: &Path, text: &str) -> Result<EnvFile, AppError> {
        EnvFile::parse(text).map_err(|(line, message)| AppError::EnvFileParse {
            path: path.to_path_buf(),
            line,
            message,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl FromIterator<(String, String)> for EnvFile {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        EnvFile {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Outcome of looking for the environment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvLoad {
    /// The file existed and parsed cleanly.
    Loaded { path: PathBuf, vars: EnvFile },
    /// No file at `path`; configuration is empty.
    Absent { path: PathBuf },
}

impl EnvLoad {
    pub fn path(&self) -> &Path {
        match self {
            EnvLoad::Loaded { path, .. } | EnvLoad::Absent { path } => path,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, EnvLoad::Loaded { .. })
    }

    /// The mapping; empty when the file was absent.
    pub fn vars(&self) -> EnvFile {
        match self {
            EnvLoad::Loaded { vars, .. } => vars.clone(),
            EnvLoad::Absent { .. } => EnvFile::default(),
        }
    }

    pub fn into_vars(self) -> EnvFile {
        match self {
            EnvLoad::Loaded { vars, .. } => vars,
            EnvLoad::Absent { .. } => EnvFile::default(),
        }
    }

    /// The single line reported to the operator after a load attempt.
    pub fn diagnostic(&self) -> String {
        match self {
            EnvLoad::Loaded { .. } => format!("Loaded {} file", ENV_FILE_NAME),
            EnvLoad::Absent { path } => {
                format!("{} file not found at {}", ENV_FILE_NAME, path.display())
            }
        }
    }
}

/// Loads `<root>/.env`.
///
/// A missing file is not an error: it yields [`EnvLoad::Absent`] carrying the
/// absolute path that was tried. A file that exists but cannot be read or parsed
/// fails the load.
pub fn load(root: &Path) -> Result<EnvLoad, AppError> {
    let path = absolute(&root.join(ENV_FILE_NAME))?;

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{} file not found at {}", ENV_FILE_NAME, path.display());
            return Ok(EnvLoad::Absent { path });
        }
        Err(e) => {
            return Err(AppError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let vars = EnvFile::parse_file(&path, &text)?;
    info!("Loaded {} keys from {}", vars.len(), path.display());
    Ok(EnvLoad::Loaded { path, vars })
}

fn absolute(path: &Path) -> Result<PathBuf, AppError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let current_dir = std::env::current_dir()
        .map_err(|e| AppError::Io(format!("Failed to resolve current directory: {}", e)))?;
    Ok(current_dir.join(path))
}
