//! Command-line surface of the `user-service` binary.
//!
//! Each subcommand receives the project root and, when it needs one, the
//! configuration loaded from `<root>/.env` for this invocation.

use crate::auth::{JwtSettings, JwtUtil};
use crate::config::{self, EnvConfig};
use crate::env_file;
use crate::error::AppError;
use crate::migration::{self, MigrationSettings};
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const USAGE: &str = "\
Usage: user-service [-C <project-root>] <command> [args]

Commands:
  migrate-configure [--json]        Show the migration settings built from .env
  print-configuration               Print the recognized .env keys
  print-project-root                Print the resolved project root
  migrate                           Apply pending migration scripts
  info                              List applied and pending migrations
  clean                             Drop the configured schemas
  token issue <subject> [--session] Issue an access token
  token verify <token> <subject>    Check an access token
  help                              Show this message

Options:
  -C <dir>    Project root (default: $USER_SERVICE_ROOT or the current directory)
  -h, --help  Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    MigrateConfigure { json: bool },
    PrintConfiguration,
    PrintProjectRoot,
    Migrate,
    Info,
    Clean,
    TokenIssue { subject: String, with_session: bool },
    TokenVerify { token: String, subject: String },
    Help,
}

impl Command {
    /// Whether the command reads the `.env` file.
    pub fn needs_config(&self) -> bool {
        !matches!(self, Command::PrintProjectRoot | Command::Help)
    }
}

#[derive(Debug)]
pub struct ParsedArgs {
    pub root: Option<PathBuf>,
    pub command: Command,
}

pub fn parse_args() -> Result<ParsedArgs, AppError> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(args: I) -> Result<ParsedArgs, AppError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut root = None;
    let mut help = false;
    let mut tokens = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--" => {
                tokens.extend(args.by_ref());
                break;
            }
            "-h" | "--help" => help = true,
            "-C" => {
                let value = args
                    .next()
                    .ok_or_else(|| AppError::Usage("Missing value for -C".into()))?;
                root = Some(PathBuf::from(value));
            }
            _ => tokens.push(arg),
        }
    }

    if help {
        return Ok(ParsedArgs {
            root,
            command: Command::Help,
        });
    }
    let command = parse_command(&tokens)?;
    Ok(ParsedArgs { root, command })
}

fn parse_command(tokens: &[String]) -> Result<Command, AppError> {
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        [] | ["help"] => Command::Help,
        ["migrate-configure"] => Command::MigrateConfigure { json: false },
        ["migrate-configure", "--json"] => Command::MigrateConfigure { json: true },
        ["print-configuration"] | ["printEnvProps"] => Command::PrintConfiguration,
        ["print-project-root"] | ["printProjectRoot"] => Command::PrintProjectRoot,
        ["migrate"] => Command::Migrate,
        ["info"] => Command::Info,
        ["clean"] => Command::Clean,
        ["token", "issue", subject] => Command::TokenIssue {
            subject: subject.to_string(),
            with_session: false,
        },
        ["token", "issue", subject, "--session"] => Command::TokenIssue {
            subject: subject.to_string(),
            with_session: true,
        },
        ["token", "verify", token, subject] => Command::TokenVerify {
            token: token.to_string(),
            subject: subject.to_string(),
        },
        _ => {
            return Err(AppError::Usage(format!(
                "unrecognized command '{}'",
                words.join(" ")
            )))
        }
    };
    Ok(command)
}

/// Loads `<root>/.env` and reports the outcome on `out`.
pub fn load_config<W: Write>(root: &Path, out: &mut W) -> Result<EnvConfig, AppError> {
    let load = env_file::load(root)?;
    writeln!(out, "{}", load.diagnostic())?;
    Ok(EnvConfig::from_load(load))
}

/// Runs a parsed command against `root`, writing its output to `out`.
pub async fn run<W: Write>(command: Command, root: &Path, out: &mut W) -> Result<(), AppError> {
    if !command.needs_config() {
        if command == Command::PrintProjectRoot {
            return config::print_project_root(root, out);
        }
        writeln!(out, "{}", USAGE)?;
        return Ok(());
    }

    let env = load_config(root, out)?;
    match command {
        Command::MigrateConfigure { json } => migrate_configure(&env, json, out),
        Command::PrintConfiguration => config::print_configuration(&env, out),
        Command::Migrate => migrate(&env, root, out).await,
        Command::Info => migration_info(&env, root, out).await,
        Command::Clean => clean(&env, out).await,
        Command::TokenIssue {
            subject,
            with_session,
        } => issue_token(&env, &subject, with_session, out),
        Command::TokenVerify { token, subject } => verify_token(&env, &token, &subject, out),
        Command::Help | Command::PrintProjectRoot => Ok(()),
    }
}

fn migrate_configure<W: Write>(config: &EnvConfig, json: bool, out: &mut W) -> Result<(), AppError> {
    let settings = MigrationSettings::from_config(config);
    if json {
        let rendered = serde_json::to_string_pretty(&settings.redacted())
            .map_err(|e| AppError::Io(format!("Failed to render settings: {}", e)))?;
        writeln!(out, "{}", rendered)?;
    } else {
        writeln!(out, "Migration settings:")?;
        for line in settings.describe() {
            writeln!(out, "  {}", line)?;
        }
    }
    Ok(())
}

async fn migrate<W: Write>(config: &EnvConfig, root: &Path, out: &mut W) -> Result<(), AppError> {
    let settings = MigrationSettings::from_config(config);
    let report = migration::migrate(&settings, root).await?;

    for schema in &report.created_schemas {
        writeln!(out, "Created schema \"{}\"", schema)?;
    }
    if report.baselined {
        writeln!(
            out,
            "Baselined schema \"{}\" at version {}",
            settings.default_schema, settings.baseline_version
        )?;
    }
    let current = report
        .current_version
        .clone()
        .unwrap_or_else(|| "<< Empty Schema >>".to_string());
    if report.applied.is_empty() {
        writeln!(
            out,
            "Schema \"{}\" is up to date at version {}. No migration necessary.",
            settings.default_schema, current
        )?;
    } else {
        writeln!(
            out,
            "Successfully applied {} migration(s) to schema \"{}\", now at version {}",
            report.applied.len(),
            settings.default_schema,
            current
        )?;
    }
    info!("Migration finished: {:?}", report);
    Ok(())
}

async fn migration_info<W: Write>(config: &EnvConfig, root: &Path, out: &mut W) -> Result<(), AppError> {
    let settings = MigrationSettings::from_config(config);
    let rows = migration::info(&settings, root).await?;
    writeln!(
        out,
        "{:<10} | {:<40} | {:<14} | Installed On",
        "Version", "Description", "State"
    )?;
    for row in rows {
        writeln!(out, "{}", row)?;
    }
    Ok(())
}

async fn clean<W: Write>(config: &EnvConfig, out: &mut W) -> Result<(), AppError> {
    let settings = MigrationSettings::from_config(config);
    let dropped = migration::clean(&settings).await?;
    if dropped.is_empty() {
        writeln!(out, "Nothing to clean")?;
    } else {
        writeln!(out, "Successfully cleaned schema(s): {}", dropped.join(", "))?;
    }
    Ok(())
}

fn issue_token<W: Write>(
    config: &EnvConfig,
    subject: &str,
    with_session: bool,
    out: &mut W,
) -> Result<(), AppError> {
    let util = JwtUtil::new(JwtSettings::from_config(config)?)?;
    let token = if with_session {
        util.generate_token_with_session_id(subject, Uuid::new_v4())?
    } else {
        util.generate_token(subject)?
    };
    writeln!(out, "{}", token)?;
    Ok(())
}

fn verify_token<W: Write>(
    config: &EnvConfig,
    token: &str,
    subject: &str,
    out: &mut W,
) -> Result<(), AppError> {
    let util = JwtUtil::new(JwtSettings::from_config(config)?)?;
    let token = util.strip_prefix(token).unwrap_or(token);
    let claims = util.extract_all_claims(token)?;
    if !util.validate_token(token, subject) {
        return Err(AppError::Token(format!(
            "Token was issued to {}, not {}",
            claims.sub, subject
        )));
    }

    writeln!(out, "Subject: {}", claims.sub)?;
    writeln!(out, "Expires: {}", util.extract_expiration(token)?.to_rfc3339())?;
    if let Some(session_id) = claims.session_id {
        writeln!(out, "Session: {}", session_id)?;
    }
    writeln!(out, "Token is valid")?;
    Ok(())
}
