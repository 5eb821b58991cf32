// Integration tests for CLI commands
// These run the built binary and only exercise commands that need no
// network peers or service accounts.

use std::process::Command;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_trustseed");

#[test]
fn test_cli_help() {
    let output = Command::new(BIN)
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in [
        "init-config",
        "bootstrap",
        "generate",
        "serve",
        "fetch",
        "install",
        "fingerprint",
        "version",
    ] {
        assert!(stdout.contains(command), "help should list {}", command);
    }
}

#[test]
fn test_cli_version() {
    let output = Command::new(BIN)
        .arg("version")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_init_config_then_fingerprint() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");

    let output = Command::new(BIN)
        .args(["init-config", "--role", "follower", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());
    assert!(std::fs::read_to_string(&config)
        .unwrap()
        .contains("role = \"follower\""));

    let bundle = temp_dir.path().join("bundle.p12");
    std::fs::write(&bundle, b"keystore").unwrap();
    let output = Command::new(BIN)
        .arg("fingerprint")
        .arg(&bundle)
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // sha256("keystore")
    let expected = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(b"keystore"))
    };
    assert!(stdout.starts_with(&expected));
}

#[test]
fn test_cli_bootstrap_with_invalid_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");
    std::fs::write(&config, "[node]\nrole = \"follower\"\n").unwrap();

    let output = Command::new(BIN)
        .arg("bootstrap")
        .arg("--config")
        .arg(&config)
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("Error:"));
    assert!(stderr.contains("node.cluster_name"));
    assert!(stderr.contains("node.seed_hosts"));
}
