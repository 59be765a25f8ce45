use crate::env_file::{EnvFile, EnvLoad};
use crate::error::AppError;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DB_URL: &str = "DB_URL";
pub const DB_USERNAME: &str = "DB_USERNAME";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_NAME: &str = "DB_NAME";
pub const DB_PORT: &str = "DB_PORT";
pub const JWT_SECRET_KEY: &str = "JWT_SECRET_KEY";
pub const JWT_VALIDITY: &str = "JWT_VALIDITY";

/// Keys reported by `print-configuration`, in output order.
pub const RECOGNIZED_KEYS: [&str; 7] = [
    DB_URL,
    DB_USERNAME,
    DB_PASSWORD,
    DB_NAME,
    DB_PORT,
    JWT_SECRET_KEY,
    JWT_VALIDITY,
];

/// Placeholder printed for keys missing from the `.env` file.
pub const NOT_FOUND: &str = "NOT FOUND";

/// Environment variable that overrides the project root when `-C` is not given.
pub const ROOT_ENV_VAR: &str = "USER_SERVICE_ROOT";

/// Configuration loaded from the `.env` file for one invocation.
///
/// Built once in `main` and handed by reference to each command.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    vars: EnvFile,
}

impl EnvConfig {
    pub fn new(vars: EnvFile) -> Self {
        Self { vars }
    }

    pub fn from_load(load: EnvLoad) -> Self {
        Self::new(load.into_vars())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key)
    }

    pub fn get_owned(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    pub fn get_or_not_found(&self, key: &str) -> &str {
        self.get(key).unwrap_or(NOT_FOUND)
    }

    pub fn vars(&self) -> &EnvFile {
        &self.vars
    }
}

/// Writes every recognized key with its value, or `NOT FOUND` when absent.
pub fn print_configuration<W: Write>(config: &EnvConfig, out: &mut W) -> Result<(), AppError> {
    writeln!(out, "Values from .env file:")?;
    for key in RECOGNIZED_KEYS {
        writeln!(out, "{}: {}", key, config.get_or_not_found(key))?;
    }
    Ok(())
}

pub fn print_project_root<W: Write>(root: &Path, out: &mut W) -> Result<(), AppError> {
    writeln!(out, "Project Root: {}", root.display())?;
    Ok(())
}

/// Resolves the project root: the explicit directory if given, else
/// `USER_SERVICE_ROOT`, else the current directory. Always absolute.
pub fn resolve_project_root(explicit: Option<PathBuf>) -> Result<PathBuf, AppError> {
    let root = explicit
        .or_else(|| env::var_os(ROOT_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    make_absolute(root)
}

fn make_absolute(path: PathBuf) -> Result<PathBuf, AppError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let current_dir = env::current_dir()
        .map_err(|e| AppError::Io(format!("Failed to resolve current directory: {}", e)))?;
    if path == Path::new(".") {
        return Ok(current_dir);
    }
    Ok(current_dir.join(path))
}
