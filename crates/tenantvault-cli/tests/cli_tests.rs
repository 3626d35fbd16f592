//! Integration tests for the `tenantvault` CLI binary.
//!
//! These tests run the CLI as a subprocess and check exit codes, output and
//! the records left in a file-backed mapping store. The full-run tests
//! point the binary at a local fake management API and a scripted stand-in
//! for Terraform, so no cloud account is needed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

/// Every variable the binary reads, cleared so the host environment cannot leak in.
const CONFIG_VARS: &[&str] = &[
    "ATLAS_PUBLIC_KEY",
    "ATLAS_PRIVATE_KEY",
    "ATLAS_ORG_ID",
    "ATLAS_SOURCE_PROJECT_ID",
    "GCP_PROJECT_ID",
    "ATLAS_API_BASE_URL",
    "ATLAS_HTTP_TIMEOUT_SECS",
    "USER_COUNT_THRESHOLD",
    "PRIVATE_IP_WHITELIST",
    "TERRAFORM_BIN",
    "TERRAFORM_DIR",
    "TERRAFORM_TIMEOUT_SECS",
    "CSFLE_MASTER_KEY",
    "ALLOW_PLAINTEXT_FALLBACK",
    "MAPPING_STORE",
    "MAPPING_DB_CONNECTION_STRING",
    "MAPPING_STORE_PATH",
    "MAPPING_DB_NAME",
    "MAPPING_COLLECTION_NAME",
    "RUST_LOG",
];

/// Helper: locate the `tenantvault` binary built by `cargo test`.
fn tenantvault_bin() -> String {
    let path = env!("CARGO_BIN_EXE_tenantvault");
    assert!(
        Path::new(path).exists(),
        "tenantvault binary not found at {path}"
    );
    path.to_owned()
}

fn command(args: &[&str], env: &[(&str, &str)]) -> Command {
    let mut cmd = Command::new(tenantvault_bin());
    cmd.args(args);
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd.env("TENANTVAULT_LOG_LEVEL", "warn");
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}

/// Helper: run tenantvault and return (`exit_code`, stdout, stderr).
fn run(args: &[&str], env: &[(&str, &str)]) -> (i32, String, String) {
    let output = command(args, env)
        .output()
        .expect("failed to execute tenantvault");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"], &[]);
    assert_eq!(code, 0, "tenantvault --version should exit 0");
    assert!(
        stdout.contains("tenantvault"),
        "version output should contain 'tenantvault': {stdout}"
    );
}

#[test]
fn test_help_flag() {
    let (code, stdout, _) = run(&["--help"], &[]);
    assert_eq!(code, 0, "tenantvault --help should exit 0");
    assert!(stdout.contains("TenantVault CLI"), "help should mention TenantVault CLI");
    for sub in ["run", "check", "keygen", "reveal", "scale"] {
        assert!(stdout.contains(sub), "help should list '{sub}': {stdout}");
    }
}

#[test]
fn test_subcommand_help() {
    for sub in ["run", "check", "keygen", "reveal", "scale"] {
        let (code, stdout, _) = run(&[sub, "--help"], &[]);
        assert_eq!(code, 0, "{sub} --help should exit 0");
        assert!(!stdout.is_empty(), "{sub} --help should produce output");
    }
    let (_, stdout, _) = run(&["scale", "--help"], &[]);
    assert!(stdout.contains("--instance-size"));
    assert!(stdout.contains("M30"));
}

// ── Keygen ───────────────────────────────────────────────────────────

#[test]
fn test_keygen_prints_96_byte_key() {
    let (code, stdout, _) = run(&["keygen"], &[]);
    assert_eq!(code, 0);
    let key = stdout.trim();
    // 96 bytes encode to exactly 128 base64 characters with no padding.
    assert_eq!(key.len(), 128, "unexpected key: {key}");
    assert!(
        key.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
    );
}

#[test]
fn test_keygen_is_random() {
    let (_, first, _) = run(&["keygen"], &[]);
    let (_, second, _) = run(&["keygen"], &[]);
    assert_ne!(first, second);
}

// ── Configuration errors ─────────────────────────────────────────────

#[test]
fn test_run_without_config_lists_missing_vars() {
    let (code, stdout, stderr) = run(&["run"], &[]);
    assert_ne!(code, 0, "run without configuration should fail");
    assert!(!stdout.contains("Provisioning complete"));
    for var in [
        "ATLAS_PUBLIC_KEY",
        "ATLAS_PRIVATE_KEY",
        "ATLAS_ORG_ID",
        "ATLAS_SOURCE_PROJECT_ID",
        "GCP_PROJECT_ID",
    ] {
        assert!(stderr.contains(var), "should name {var}: {stderr}");
    }
}

#[test]
fn test_invalid_threshold_is_rejected() {
    let (code, _, stderr) = run(
        &["check"],
        &[
            ("ATLAS_PUBLIC_KEY", "pub"),
            ("ATLAS_PRIVATE_KEY", "priv"),
            ("ATLAS_ORG_ID", "org"),
            ("ATLAS_SOURCE_PROJECT_ID", "src"),
            ("GCP_PROJECT_ID", "gcp"),
            ("USER_COUNT_THRESHOLD", "lots"),
        ],
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("USER_COUNT_THRESHOLD"), "{stderr}");
}

#[test]
fn test_reveal_requires_master_key() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run(
        &["reveal"],
        &[("MAPPING_STORE_PATH", dir.path().to_str().unwrap())],
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("CSFLE_MASTER_KEY"), "{stderr}");
}

#[test]
fn test_reveal_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let (_, key, _) = run(&["keygen"], &[]);
    let (code, stdout, stderr) = run(
        &["reveal"],
        &[
            ("MAPPING_STORE_PATH", dir.path().to_str().unwrap()),
            ("CSFLE_MASTER_KEY", key.trim()),
        ],
    );
    assert_eq!(code, 0, "{stderr}");
    assert!(stdout.contains("No matching records"), "{stdout}");
}

// ── Full runs against local fakes ────────────────────────────────────

#[cfg(unix)]
mod full_run {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::{CONFIG_VARS, tenantvault_bin};

    const CHALLENGE: &str =
        r#"Digest realm="MMS Public API", nonce="0a4f113b", algorithm=MD5, qop="auth""#;

    async fn list_users(State(users): State<usize>, headers: HeaderMap) -> Response {
        let answered = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Digest ") && v.contains("username=\"pub\""));
        if !answered {
            return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, CHALLENGE)], "").into_response();
        }
        let results: Vec<Value> = (0..users).map(|i| json!({"username": format!("u{i}")})).collect();
        Json(json!({"results": results, "totalCount": users})).into_response()
    }

    /// Serve a fake management API reporting `users` database users.
    async fn fake_api(users: usize) -> String {
        let app = Router::new()
            .route("/api/atlas/v1.0/groups/{group}/databaseUsers", get(list_users))
            .with_state(users);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/atlas/v1.0")
    }

    /// Write a stand-in `terraform` that prints `outputs` for `output -json`.
    fn fake_terraform(dir: &Path, outputs: &Value) -> PathBuf {
        let outputs_path = dir.join("outputs.json");
        std::fs::write(&outputs_path, outputs.to_string()).unwrap();
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> \"{log}\"\ncase \"$1\" in\n  apply) exit 0 ;;\n  output) cat \"{out}\" ;;\n  *) exit 2 ;;\nesac\n",
            log = dir.join("calls.log").display(),
            out = outputs_path.display(),
        );
        let path = dir.join("terraform");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn tenantvault(args: &[&str], env: &[(&str, String)]) -> std::process::Output {
        let mut cmd = tokio::process::Command::new(tenantvault_bin());
        cmd.args(args);
        for var in CONFIG_VARS {
            cmd.env_remove(var);
        }
        cmd.env("TENANTVAULT_LOG_LEVEL", "warn");
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.output().await.unwrap()
    }

    fn base_env(api: &str, terraform: &Path, work: &Path, store: &Path) -> Vec<(&'static str, String)> {
        vec![
            ("ATLAS_PUBLIC_KEY", "pub".to_owned()),
            ("ATLAS_PRIVATE_KEY", "priv".to_owned()),
            ("ATLAS_ORG_ID", "org".to_owned()),
            ("ATLAS_SOURCE_PROJECT_ID", "src".to_owned()),
            ("GCP_PROJECT_ID", "gcp".to_owned()),
            ("ATLAS_API_BASE_URL", api.to_owned()),
            ("TERRAFORM_BIN", terraform.display().to_string()),
            ("TERRAFORM_DIR", work.display().to_string()),
            ("MAPPING_STORE", "file".to_owned()),
            ("MAPPING_STORE_PATH", store.display().to_string()),
        ]
    }

    fn stored_lines(store: &Path) -> Vec<Value> {
        std::fs::read_to_string(store.join("atlas_mappings").join("cluster_users.jsonl"))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn below_threshold_run_stores_one_encrypted_record() {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let api = fake_api(50).await;
        let terraform = fake_terraform(
            work.path(),
            &json!({"single_user_details": {"value": {
                "connection_string": "mongodb+srv://shared.example.net",
                "username": "tenant-50",
                "password": "s3cret-pw",
            }}}),
        );

        let key = tenantvault(&["keygen"], &[]).await;
        let key = String::from_utf8(key.stdout).unwrap().trim().to_owned();
        let mut env = base_env(&api, &terraform, work.path(), store.path());
        env.push(("CSFLE_MASTER_KEY", key.clone()));

        let out = tenantvault(&["run"], &env).await;
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
        assert!(stdout.contains("existing project"), "{stdout}");

        let calls = std::fs::read_to_string(work.path().join("calls.log")).unwrap();
        assert!(calls.contains("-var=create_new_project=false"));

        let records = stored_lines(store.path());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["username"], "tenant-50");
        assert_eq!(records[0]["password"]["$binary"]["subType"], "06");
        assert!(!records[0].to_string().contains("s3cret-pw"));

        let out = tenantvault(&["reveal"], &env).await;
        assert!(out.status.success());
        assert!(String::from_utf8_lossy(&out.stdout).contains("s3cret-pw"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn above_threshold_run_stores_all_users_and_surfaces_generated_key() {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let api = fake_api(95).await;
        let terraform = fake_terraform(
            work.path(),
            &json!({
                "new_project_connection_string": {"value": "mongodb+srv://fresh.example.net"},
                "new_project_users": {"value": [
                    {"username": "a", "password": "pa"},
                    {"username": "b", "password": "pb"},
                    {"username": "c", "password": "pc"},
                ]},
            }),
        );
        let env = base_env(&api, &terraform, work.path(), store.path());

        let out = tenantvault(&["run"], &env).await;
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(out.status.success(), "stderr: {stderr}");
        assert!(stderr.contains("CSFLE_MASTER_KEY="), "{stderr}");

        let records = stored_lines(store.path());
        assert_eq!(records.len(), 3);
        assert!(
            records
                .iter()
                .all(|r| r["cluster_connection_string"] == "mongodb+srv://fresh.example.net")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn check_reports_decision_without_provisioning() {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let api = fake_api(81).await;
        let terraform = fake_terraform(work.path(), &json!({}));
        let env = base_env(&api, &terraform, work.path(), store.path());

        let out = tenantvault(&["check"], &env).await;
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
        assert!(stdout.contains("create a new project"), "{stdout}");
        assert!(!work.path().join("calls.log").exists());
        assert!(stored_lines(store.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_apply_names_the_stage_and_stores_nothing() {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let api = fake_api(10).await;
        let terraform = work.path().join("terraform");
        std::fs::write(&terraform, "#!/bin/sh\necho 'Error: boom' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&terraform, std::fs::Permissions::from_mode(0o755)).unwrap();
        let env = base_env(&api, &terraform, work.path(), store.path());

        let out = tenantvault(&["run"], &env).await;
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(!out.status.success());
        assert!(stderr.contains("provisioning"), "{stderr}");
        assert!(stderr.contains("Error: boom"), "{stderr}");
        assert!(stored_lines(store.path()).is_empty());
    }
}
