//! Configuration loading tests.

use std::path::PathBuf;
use std::time::Duration;

use remote_exec::config::env::{DEFAULT_PREFIX, EnvOverrides};
use remote_exec::{Credential, HostKeyPolicy, NodeConfig, RemoteError};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("remote-exec-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn node_config_from_file() {
    let dir = temp_dir("config-file");
    let path = dir.join("node.toml");
    std::fs::write(
        &path,
        r#"
        host = "10.20.0.7"
        username = "ops"
        private_key = "id_lab"
        keys_dir = "/srv/keys"
        max_sessions = 4
        host_key_policy = "trust-on-first-use"

        [timings]
        connect_retry_interval = 500
        probe_timeout = 2000
        "#,
    )
    .unwrap();

    let config = NodeConfig::from_file(&path).unwrap();
    assert_eq!(config.host, "10.20.0.7");
    assert_eq!(config.port, 22);
    assert_eq!(config.username, "ops");
    assert_eq!(config.private_key, Some(PathBuf::from("id_lab")));
    assert_eq!(config.keys_dir, Some(PathBuf::from("/srv/keys")));
    assert_eq!(config.max_sessions, 4);
    assert_eq!(config.host_key_policy, HostKeyPolicy::TrustOnFirstUse);
    assert_eq!(config.timings.connect_retry_interval, Duration::from_millis(500));
    assert_eq!(config.timings.probe_timeout, Duration::from_secs(2));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_file_is_io_error() {
    let err = NodeConfig::from_file("/nonexistent/remote-exec/node.toml").unwrap_err();
    assert!(matches!(err, RemoteError::Io { .. }));
}

#[test]
fn key_wins_over_password() {
    let dir = temp_dir("key-wins");
    std::fs::write(dir.join("id_ed25519"), "placeholder").unwrap();

    let config = NodeConfig::parse_target("root@10.0.0.1:2200")
        .password("pw")
        .private_key("id_ed25519")
        .key_passphrase("phrase")
        .keys_dir(&dir);
    assert_eq!(config.port, 2200);
    assert!(config.is_root());

    match config.credential().unwrap() {
        Credential::PrivateKey { path, passphrase } => {
            assert_eq!(path, dir.join("id_ed25519"));
            assert_eq!(passphrase.as_deref(), Some("phrase"));
        }
        Credential::Password(_) => panic!("password chosen over key"),
    }

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn keys_dir_from_environment() {
    let dir = temp_dir("env-keys");
    std::fs::write(dir.join("lab_key"), "placeholder").unwrap();

    let env = EnvOverrides::from_vars(
        DEFAULT_PREFIX,
        [("REMOTE_EXEC_KEYS_DIR", dir.to_string_lossy().into_owned())],
    );
    let mut config = NodeConfig::new("10.0.0.2").private_key("lab_key");
    assert!(config.credential().is_err());

    env.apply(&mut config);
    assert!(config.credential().unwrap().is_private_key());
    assert!(config.validate().is_ok());

    std::fs::remove_dir_all(&dir).unwrap();
}
