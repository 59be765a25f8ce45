//! Applies migration scripts to PostgreSQL.
//!
//! Everything runs on a single connection. A session-level advisory lock keeps two
//! runners from migrating the same schema at once. Each script runs in its own
//! transaction together with the history row that records it, so a failing script
//! leaves neither partial changes nor a history entry behind.

use crate::error::AppError;
use crate::migration::history::{self, AppliedMigration, MigrationInfo, KIND_BASELINE, KIND_SQL};
use crate::migration::script::{self, MigrationScript};
use crate::migration::settings::MigrationSettings;
use log::{debug, info, warn};
use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor};
use std::path::Path;
use std::time::Instant;

/// Result of a `migrate` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub created_schemas: Vec<String>,
    pub baselined: bool,
    pub applied: Vec<String>,
    pub current_version: Option<String>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn history_table(settings: &MigrationSettings) -> String {
    format!(
        "{}.{}",
        quote_ident(&settings.default_schema),
        quote_ident(&settings.table)
    )
}

fn lock_key(settings: &MigrationSettings) -> String {
    format!("user-service:{}", settings.default_schema)
}

/// Opens a connection using the `.env` credentials.
pub async fn connect(settings: &MigrationSettings) -> Result<PgConnection, AppError> {
    let options = settings.connect_options()?;
    debug!(
        "Connecting to {}:{} as {}",
        options.get_host(),
        options.get_port(),
        options.get_username()
    );
    Ok(PgConnection::connect_with(&options).await?)
}

async fn schema_exists(conn: &mut PgConnection, schema: &str) -> Result<bool, AppError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn table_exists(conn: &mut PgConnection, schema: &str, table: &str) -> Result<bool, AppError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
    )
    .bind(schema)
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn count_tables(conn: &mut PgConnection, schema: &str) -> Result<i64, AppError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = $1")
            .bind(schema)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// Creates missing schemas when allowed; returns the ones created.
async fn ensure_schemas(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
) -> Result<Vec<String>, AppError> {
    let mut created = Vec::new();
    for schema in &settings.schemas {
        if schema_exists(conn, schema).await? {
            continue;
        }
        if !settings.create_schemas {
            return Err(AppError::Migration(format!(
                "Schema {} does not exist and schema creation is disabled",
                schema
            )));
        }
        info!("Creating schema {}", schema);
        (&mut *conn)
            .execute(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)).as_str())
            .await?;
        created.push(schema.clone());
    }
    Ok(created)
}

async fn create_history_table(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
) -> Result<(), AppError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            installed_rank INTEGER PRIMARY KEY,
            version VARCHAR(50) NOT NULL,
            description VARCHAR(200) NOT NULL,
            type VARCHAR(20) NOT NULL,
            script VARCHAR(1000) NOT NULL,
            checksum VARCHAR(64),
            installed_by VARCHAR(100) NOT NULL DEFAULT CURRENT_USER,
            installed_on TIMESTAMPTZ NOT NULL DEFAULT now(),
            execution_time INTEGER NOT NULL,
            success BOOLEAN NOT NULL
        )",
        history_table(settings)
    );
    (&mut *conn).execute(sql.as_str()).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_history_row(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
    version: &str,
    description: &str,
    kind: &str,
    script: &str,
    checksum: Option<&str>,
    execution_time: i32,
) -> Result<(), AppError> {
    let sql = format!(
        "INSERT INTO {table} (installed_rank, version, description, type, script, checksum, execution_time, success)
         SELECT COALESCE(MAX(installed_rank), 0) + 1, $1, $2, $3, $4, $5, $6, TRUE FROM {table}",
        table = history_table(settings)
    );
    sqlx::query(&sql)
        .bind(version)
        .bind(description)
        .bind(kind)
        .bind(script)
        .bind(checksum)
        .bind(execution_time)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_history(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
) -> Result<Vec<AppliedMigration>, AppError> {
    if !table_exists(conn, &settings.default_schema, &settings.table).await? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT installed_rank, version, description, type, script, checksum, installed_on, execution_time, success
         FROM {} ORDER BY installed_rank",
        history_table(settings)
    );
    Ok(sqlx::query_as::<_, AppliedMigration>(&sql)
        .fetch_all(&mut *conn)
        .await?)
}

/// Prepares the history table, baselining a non-empty schema when allowed.
/// Returns whether a baseline row was written.
async fn prepare_history(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
    schema_was_created: bool,
) -> Result<bool, AppError> {
    if table_exists(conn, &settings.default_schema, &settings.table).await? {
        return Ok(false);
    }

    let existing_tables = if schema_was_created {
        0
    } else {
        count_tables(conn, &settings.default_schema).await?
    };

    if existing_tables == 0 {
        create_history_table(conn, settings).await?;
        return Ok(false);
    }

    if !settings.baseline_on_migrate {
        return Err(AppError::Migration(format!(
            "Found non-empty schema {} without schema history table and baseline on migrate is disabled",
            settings.default_schema
        )));
    }

    warn!(
        "Schema {} contains {} tables but no history; baselining at version {}",
        settings.default_schema, existing_tables, settings.baseline_version
    );
    create_history_table(conn, settings).await?;
    insert_history_row(
        conn,
        settings,
        &settings.baseline_version,
        &settings.baseline_description,
        KIND_BASELINE,
        &settings.baseline_description,
        None,
        0,
    )
    .await?;
    Ok(true)
}

async fn apply_script(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
    script: &MigrationScript,
) -> Result<(), AppError> {
    info!(
        "Migrating schema {} to version {} - {}",
        settings.default_schema, script.version, script.description
    );
    let started = Instant::now();
    let mut tx = conn.begin().await?;

    if let Err(e) = (&mut *tx).execute(script.sql.as_str()).await {
        tx.rollback().await?;
        return Err(AppError::Migration(format!(
            "Migration {} failed and was rolled back: {}",
            script.script, e
        )));
    }

    let elapsed = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
    insert_history_row(
        &mut tx,
        settings,
        &script.version.to_string(),
        &script.description,
        KIND_SQL,
        &script.script,
        Some(&script.checksum),
        elapsed,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn migrate_locked(
    conn: &mut PgConnection,
    settings: &MigrationSettings,
    scripts: &[MigrationScript],
) -> Result<MigrationReport, AppError> {
    let created_schemas = ensure_schemas(conn, settings).await?;
    (&mut *conn)
        .execute(format!("SET search_path TO {}", quote_ident(&settings.default_schema)).as_str())
        .await?;

    let schema_was_created = created_schemas.contains(&settings.default_schema);
    let baselined = prepare_history(conn, settings, schema_was_created).await?;

    let applied = load_history(conn, settings).await?;
    let pending = history::plan(&applied, scripts, settings.validate_on_migrate)?;
    if pending.is_empty() {
        info!("Schema {} is up to date", settings.default_schema);
    }

    let mut report = MigrationReport {
        created_schemas,
        baselined,
        ..MigrationReport::default()
    };
    for script in pending {
        apply_script(conn, settings, script).await?;
        report.applied.push(script.version.to_string());
    }

    let applied = load_history(conn, settings).await?;
    report.current_version = history::current_version(&applied)?.map(|v| v.to_string());
    Ok(report)
}

/// Brings the configured schema up to date with the scripts under the project root.
pub async fn migrate(settings: &MigrationSettings, root: &Path) -> Result<MigrationReport, AppError> {
    let scripts = script::discover_all(&settings.script_dirs(root))?;
    info!("Found {} migration scripts", scripts.len());

    let mut conn = connect(settings).await?;
    sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
        .bind(lock_key(settings))
        .execute(&mut conn)
        .await?;

    let result = migrate_locked(&mut conn, settings, &scripts).await;

    let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(lock_key(settings))
        .execute(&mut conn)
        .await;
    if let Err(e) = unlocked {
        warn!("Failed to release migration lock: {}", e);
    }
    finish_run(result, conn.close().await)
}

/// The run's own outcome takes precedence over a failure to close the connection.
fn finish_run<T>(result: Result<T, AppError>, closed: Result<(), sqlx::Error>) -> Result<T, AppError> {
    if let Err(e) = closed {
        warn!("Failed to close migration connection: {}", e);
    }
    result
}

/// Reports applied, pending and missing migrations.
pub async fn info(settings: &MigrationSettings, root: &Path) -> Result<Vec<MigrationInfo>, AppError> {
    let scripts = script::discover_all(&settings.script_dirs(root))?;
    let mut conn = connect(settings).await?;
    let applied = load_history(&mut conn, settings).await?;
    conn.close().await?;
    history::info(&applied, &scripts)
}

/// Drops every configured schema, including the history table.
///
/// Refused when `clean_disabled` is set.
pub async fn clean(settings: &MigrationSettings) -> Result<Vec<String>, AppError> {
    if settings.clean_disabled {
        return Err(AppError::Migration(
            "Clean is disabled for this configuration".into(),
        ));
    }

    let mut conn = connect(settings).await?;
    let mut dropped = Vec::new();
    for schema in &settings.schemas {
        if !schema_exists(&mut conn, schema).await? {
            continue;
        }
        warn!("Dropping schema {}", schema);
        conn.execute(format!("DROP SCHEMA {} CASCADE", quote_ident(schema)).as_str())
            .await?;
        dropped.push(schema.clone());
    }
    conn.close().await?;
    Ok(dropped)
}
