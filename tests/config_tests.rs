//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("worker.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

fn worker_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("shoal-worker").unwrap()
}

fn validate(fixture: &ConfigFixture) -> assert_cmd::assert::Assert {
    worker_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
id = 0
"#,
    );

    validate(&fixture)
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
id = 1
authenticity_data = "0101010101010101"
seed_file = "/tmp/shoal/seed.bin"
detail = { zone = "east" }

[[worker.connectors]]
interface = "tcp"
settings = { address = "192.0.2.10:7400" }

[[interfaces]]
name = "tcp"
transport = "tcp"
settings = { address = "0.0.0.0:7400" }
connect_timeout_ms = 5000

[[peers]]
worker_id = 2
authenticity_data = "0202020202020202"
connectors = [{ interface = "tcp", settings = { address = "192.0.2.11:7400" } }]

[[peers]]
worker_id = 3
authenticity_data = "0303030303030303"

[worker_socket]
max_frame_bytes = 1048576

[group]
max_request_retries = 5

[commission]
update_rate_ms = 500
min_successful_update_rate = 67

[logging]
level = "debug"
file = "/tmp/shoal/worker.log"
rotation = "hourly"
max_files = 3
json_format = true

[logging.modules]
commission = "debug"
tunnel = "warn"
"#,
    );

    validate(&fixture).success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "invalid_level"
"#,
    );

    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_unknown_logging_subsystem() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging.modules]
scheduler = "debug"
"#,
    );

    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("Unknown subsystem"));
}

#[test]
fn test_invalid_update_rate() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[commission]
min_successful_update_rate = 150
"#,
    );

    validate(&fixture).failure();
}

#[test]
fn test_member_without_authenticity_data() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
id = 4
"#,
    );

    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("authenticity"));
}

#[test]
fn test_duplicate_peer() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[[peers]]
worker_id = 2
authenticity_data = "aa"

[[peers]]
worker_id = 2
authenticity_data = "bb"
"#,
    );

    validate(&fixture).failure();
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker
id = 0
"#,
    );

    validate(&fixture).failure();
}

// ─────────────────────────────────────────────────────────────────
// Config Show Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_custom() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
id = 7
authenticity_data = "abcdef"

[commission]
update_rate_ms = 2500
"#,
    );

    worker_cmd()
        .arg("config")
        .arg("show")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("id = 7"))
        .stdout(predicate::str::contains("abcdef"))
        .stdout(predicate::str::contains("2500"));
}

// ─────────────────────────────────────────────────────────────────
// Config Init Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_init_creates_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nested").join("worker.toml");

    worker_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    assert!(config_path.exists());

    // The generated file must itself be valid
    worker_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success();
}

#[test]
fn test_config_init_refuses_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[worker]\n");

    worker_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_config_init_force_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[worker]\nid = 0\n# old-marker\n");

    worker_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(fixture.path())
        .arg("--force")
        .assert()
        .success();

    let content = fs::read_to_string(fixture.path()).unwrap();
    assert!(!content.contains("old-marker"));
    assert!(content.contains("[commission]"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Variable Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_identity() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
id = 0
"#,
    );

    worker_cmd()
        .arg("config")
        .arg("show")
        .arg("--config")
        .arg(fixture.path())
        .env("SHOAL_WORKER_ID", "12")
        .env("SHOAL_AUTHENTICITY_DATA", "c0ffee")
        .assert()
        .success()
        .stdout(predicate::str::contains("id = 12"))
        .stdout(predicate::str::contains("c0ffee"));
}

#[test]
fn test_env_override_commission() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[commission]\nupdate_rate_ms = 1000\n");

    worker_cmd()
        .arg("config")
        .arg("show")
        .arg("--config")
        .arg(fixture.path())
        .env("SHOAL_UPDATE_RATE_MS", "333")
        .env("SHOAL_MIN_SUCCESSFUL_UPDATE_RATE", "75")
        .assert()
        .success()
        .stdout(predicate::str::contains("update_rate_ms = 333"))
        .stdout(predicate::str::contains("min_successful_update_rate = 75"));
}

#[test]
fn test_env_override_invalid_value_rejected() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[worker]\nid = 0\n");

    worker_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .env("SHOAL_LOG_LEVEL", "loud")
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────
// Path Expansion Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[worker]
seed_file = "~/shoal/seed.bin"

[logging]
file = "~/shoal/worker.log"
"#,
    );

    let output = worker_cmd()
        .arg("config")
        .arg("show")
        .arg("--config")
        .arg(fixture.path())
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("seed.bin"));
    assert!(!stdout.contains("seed_file = \"~"));
    assert!(!stdout.contains("file = \"~"));
}
