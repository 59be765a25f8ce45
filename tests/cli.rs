use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use user_service::cli::{self, Command};
use user_service::config::RECOGNIZED_KEYS;
use user_service::env_file;
use user_service::migration::{script, MigrationSettings};
use user_service::{AppError, EnvConfig, EnvLoad};

async fn run(command: Command, root: &Path) -> Result<String, AppError> {
    let mut out = Vec::new();
    cli::run(command, root, &mut out).await?;
    Ok(String::from_utf8(out).expect("utf-8 output"))
}

fn project_with_env(contents: &str) -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join(".env"), contents).expect("write .env");
    dir
}

#[test_log::test]
fn test_load_round_trips_values() {
    let pairs = [
        ("DB_URL", "jdbc:postgresql://localhost:5432/autohub"),
        ("DB_USERNAME", "admin"),
        ("DB_PASSWORD", "p@ss=word$1"),
        ("JWT_VALIDITY", "3600"),
    ];
    let contents: String = pairs.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect();
    let dir = project_with_env(&contents);

    let load = env_file::load(dir.path()).expect("load .env");
    assert!(load.is_loaded());
    let vars = load.vars();
    for (key, value) in pairs {
        assert_eq!(vars.get(key), Some(value));
    }
}

#[test_log::test]
fn test_absent_file_is_not_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let load = env_file::load(dir.path()).expect("load .env");

    match &load {
        EnvLoad::Absent { path } => assert_eq!(path, &dir.path().join(".env")),
        other => panic!("Expected absent file, got {:?}", other),
    }
    assert!(load.vars().is_empty());
    assert!(load
        .diagnostic()
        .contains(&dir.path().join(".env").display().to_string()));
}

#[test_log::test]
fn test_malformed_file_fails_the_load() {
    let dir = project_with_env("DB_URL=jdbc:postgresql://localhost/autohub\nDB_PASSWORD\n");
    match env_file::load(dir.path()) {
        Err(AppError::EnvFileParse { line, path, .. }) => {
            assert_eq!(line, 2);
            assert_eq!(path, dir.path().join(".env"));
        }
        other => panic!("Expected parse error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_print_configuration_without_env_file() {
    let dir = TempDir::new().expect("temp dir");
    let output = run(Command::PrintConfiguration, dir.path()).await.unwrap();
    let lines: Vec<&str> = output.lines().collect();

    assert!(lines[0].starts_with(".env file not found at "));
    assert_eq!(lines[1], "Values from .env file:");
    let expected: Vec<String> = RECOGNIZED_KEYS
        .iter()
        .map(|key| format!("{}: NOT FOUND", key))
        .collect();
    assert_eq!(lines[2..].to_vec(), expected);
}

#[tokio::test]
async fn test_print_configuration_with_db_url_only() {
    let dir = project_with_env("DB_URL=jdbc:postgresql://localhost:5432/autohub\n");
    let output = run(Command::PrintConfiguration, dir.path()).await.unwrap();
    let lines: Vec<&str> = output.lines().collect();

    assert_eq!(lines[0], "Loaded .env file");
    assert_eq!(lines[2], "DB_URL: jdbc:postgresql://localhost:5432/autohub");
    assert_eq!(
        lines[3..].to_vec(),
        vec![
            "DB_USERNAME: NOT FOUND",
            "DB_PASSWORD: NOT FOUND",
            "DB_NAME: NOT FOUND",
            "DB_PORT: NOT FOUND",
            "JWT_SECRET_KEY: NOT FOUND",
            "JWT_VALIDITY: NOT FOUND",
        ]
    );
}

#[tokio::test]
async fn test_comment_is_ignored_end_to_end() {
    let dir = project_with_env("# comment\nDB_USERNAME=admin\n");
    let output = run(Command::PrintConfiguration, dir.path()).await.unwrap();
    assert!(output.contains("DB_USERNAME: admin\n"));
    assert!(!output.contains("comment"));
}

#[tokio::test]
async fn test_print_project_root_ignores_malformed_env() {
    let dir = project_with_env("this is not a pair\n");
    let output = run(Command::PrintProjectRoot, dir.path()).await.unwrap();
    assert_eq!(output, format!("Project Root: {}\n", dir.path().display()));

    let err = run(Command::PrintConfiguration, dir.path()).await.unwrap_err();
    assert!(matches!(err, AppError::EnvFileParse { line: 1, .. }));
}

#[tokio::test]
async fn test_migrate_configure_uses_fixed_policy() {
    let dir = project_with_env(
        "DB_URL=jdbc:postgresql://localhost:5432/autohub\nDB_USERNAME=admin\nDB_PASSWORD=secret\n",
    );
    let output = run(Command::MigrateConfigure { json: true }, dir.path())
        .await
        .unwrap();
    let json_start = output.find('{').expect("json output");
    let settings: serde_json::Value = serde_json::from_str(&output[json_start..]).unwrap();

    assert_eq!(settings["url"], "jdbc:postgresql://localhost:5432/autohub");
    assert_eq!(settings["user"], "admin");
    assert_eq!(settings["password"], "******");
    assert_eq!(settings["schemas"], serde_json::json!(["autohub"]));
    assert_eq!(settings["defaultSchema"], "autohub");
    assert_eq!(settings["createSchemas"], true);
    assert_eq!(settings["baselineOnMigrate"], true);
    assert_eq!(settings["cleanDisabled"], false);
}

#[tokio::test]
async fn test_migrate_configure_without_env_file() {
    let dir = TempDir::new().expect("temp dir");
    let output = run(Command::MigrateConfigure { json: false }, dir.path())
        .await
        .unwrap();
    assert!(output.contains("url: <unset>"));
    assert!(output.contains("defaultSchema: autohub"));
    assert!(output.contains("createSchemas: true"));
}

#[tokio::test]
async fn test_token_issue_and_verify() {
    let dir = project_with_env(
        "JWT_SECRET_KEY=testSecretKeyWithAtLeast32Characters1234567890\nJWT_VALIDITY=600\n",
    );
    let issued = run(
        Command::TokenIssue {
            subject: "test@example.com".into(),
            with_session: true,
        },
        dir.path(),
    )
    .await
    .unwrap();
    let token = issued.lines().last().expect("token line").to_string();

    let verified = run(
        Command::TokenVerify {
            token: format!("Bearer {}", token),
            subject: "test@example.com".into(),
        },
        dir.path(),
    )
    .await
    .unwrap();
    assert!(verified.contains("Subject: test@example.com"));
    assert!(verified.contains("Session: "));
    assert!(verified.contains("Token is valid"));

    let wrong_subject = run(
        Command::TokenVerify {
            token,
            subject: "other@example.com".into(),
        },
        dir.path(),
    )
    .await;
    assert!(matches!(wrong_subject, Err(AppError::Token(_))));
}

#[tokio::test]
async fn test_token_issue_requires_secret() {
    let dir = TempDir::new().expect("temp dir");
    let result = run(
        Command::TokenIssue {
            subject: "test@example.com".into(),
            with_session: false,
        },
        dir.path(),
    )
    .await;
    assert!(matches!(result, Err(AppError::MissingSetting(_))));
}

#[test]
fn test_shipped_migration_scripts() {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let settings = MigrationSettings::from_config(&EnvConfig::default());
    let scripts = script::discover_all(&settings.script_dirs(&root)).expect("discover scripts");

    let names: Vec<&str> = scripts.iter().map(|s| s.description.as_str()).collect();
    assert_eq!(
        names,
        vec!["create users", "create roles", "create user sessions"]
    );
}
