//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

/// Every environment variable the node reads
pub const NODE_ENV_VARS: &[&str] = &[
    "OTTER_CONFIG",
    "OTTER_NODE_ID",
    "OTTER_CONTAINER_NAME",
    "OTTER_ROLE",
    "OTTER_DEVICE",
    "OTTER_TAGS",
    "OTTER_LISTEN_HOST",
    "OTTER_LISTEN_PORT",
    "SERVICE_NAME",
    "OTTER_ADVERTISE_ADDRESS",
    "OTTER_REGISTRY_URL",
    "OTTER_POLL_INTERVAL_MS",
    "OTTER_DEREGISTER_ON_SHUTDOWN",
    "OTTER_TARGET_ROLES",
    "OTTER_CONNECT_TIMEOUT_MS",
    "OTTER_RETRY_DELAY_MS",
    "OTTER_MAX_FRAME_BYTES",
    "OTTER_LOG_LEVEL",
    "OTTER_LOG_FILE",
    "OTTER_LOG_JSON",
    "RUST_LOG",
];

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// The node binary, isolated from the caller's environment and config
/// search path: it runs inside `home` with HOME pointing there too.
pub fn node_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("otter-node").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"));
    for var in NODE_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(fixtures_dir().exists());
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
