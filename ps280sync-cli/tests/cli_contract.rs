//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ps280sync");
    cmd.env_remove("PS280SYNC_PORT")
        .env_remove("PS280SYNC_CONFIG")
        .env_remove("PS280SYNC_NON_INTERACTIVE");
    cmd
}

/// A firmware root with one complete version directory.
fn firmware_root(version: &str) -> tempfile::TempDir {
    let dir = tempdir().expect("tempdir should be created");
    let version_dir = dir.path().join(version);
    fs::create_dir(&version_dir).expect("create version dir");
    for name in ["bootloader.bin", "partition-table.bin", "pikk-sense-esp32s3.bin"] {
        fs::write(version_dir.join(name), b"\xE9image").expect("write image");
    }
    dir
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ps280sync"))
        .stdout(predicate::str::contains("apply"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ps280sync"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_bash_exits_zero() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("ps280sync"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    // Hosts without port enumeration support may fail; a success must be JSON.
    if output.status.success() {
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
        assert_eq!(parsed["ok"], true);
        assert!(parsed["data"]["ports"].is_array());
    }
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_malformed_key() {
    let mut cmd = cli_cmd();
    cmd.args(["get", "CORE"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("GROUP.PARAMETER"));
}

#[test]
fn exit_code_two_for_missing_apply_file_argument() {
    let mut cmd = cli_cmd();
    cmd.arg("apply")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn apply_missing_file_fails_before_touching_device() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("site.toml");

    let mut cmd = cli_cmd();
    cmd.arg("apply")
        .arg("--json")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"))
        .stderr(predicate::str::contains("site.toml"));
}

#[test]
fn apply_invalid_toml_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let file = dir.path().join("site.toml");
    fs::write(&file, "[CORE\nMSI = ").expect("write config");

    let mut cmd = cli_cmd();
    cmd.arg("apply")
        .arg(file.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid TOML"));
}

#[test]
fn firmware_list_json_lists_version_directories() {
    let dir = firmware_root("1.4.2");
    fs::create_dir(dir.path().join("1.3.0")).expect("create version dir");
    fs::write(dir.path().join("notes.txt"), b"not a version").expect("write file");

    let mut cmd = cli_cmd();
    let output = cmd
        .args(["firmware", "list", "--json", "--dir"])
        .arg(dir.path())
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert_eq!(parsed["data"]["versions"], serde_json::json!(["1.3.0", "1.4.2"]));
}

#[test]
fn firmware_list_missing_dir_fails() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = cli_cmd();
    cmd.args(["firmware", "list", "--dir"])
        .arg(dir.path().join("absent"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn firmware_flash_unknown_version_fails() {
    let dir = firmware_root("1.4.2");

    let mut cmd = cli_cmd();
    cmd.args(["--yes", "firmware", "flash", "9.9.9", "--dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("9.9.9"));
}

#[test]
fn firmware_flash_incomplete_version_fails() {
    let dir = firmware_root("1.4.2");
    fs::remove_file(dir.path().join("1.4.2").join("partition-table.bin"))
        .expect("remove image");

    let mut cmd = cli_cmd();
    cmd.args(["--yes", "firmware", "flash", "1.4.2", "--dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("partition"));
}

#[test]
fn non_interactive_flash_without_yes_is_usage_error() {
    let dir = firmware_root("1.4.2");

    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "firmware", "flash", "1.4.2", "--dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn non_interactive_erase_without_yes_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "firmware", "erase"])
        .assert()
        .failure()
        .code(2);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = firmware_root("1.0.0");
    fs::write(dir.path().join("ps280sync.toml"), "invalid toml [[[").expect("write config");

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["firmware", "list", "--dir", "."])
        .output()
        .expect("command should execute");

    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn local_config_supplies_firmware_dir() {
    let dir = firmware_root("2.0.0");
    fs::write(dir.path().join("ps280sync.toml"), "[firmware]\ndir = \".\"\n")
        .expect("write config");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["firmware", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2.0.0"));
}

#[test]
fn missing_explicit_config_warns_and_continues() {
    let dir = firmware_root("1.0.0");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["firmware", "list", "--dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Could not load config"));
}
