use serial_test::serial;
use std::{fs, path::PathBuf};
use tempfile::TempDir;
use webreq_config::ConfigLoader;

/// Helper to write a YAML file in a temp dir and return its path.
fn write_yaml(tmp: &TempDir, name: &str, yaml: &str) -> PathBuf {
    let p = tmp.path().join(name);
    fs::write(&p, yaml).expect("write yaml");
    p
}

#[test]
#[serial]
fn test_config_load() {
    let tmp = TempDir::new().unwrap();

    let file_yaml = r#"
version: 0.1
database:
  path: "${WEBREQ_TEST_DB_PATH}"
defaults:
  bps_limit: 5000.0
  retries: 4
domains:
  - name: example.com
    bps_limit: 2000.0
    max_concurrent: 4
  - name: slow.example.org
    timeout_secs: 120
    retry_http: true
  "#;
    let p = write_yaml(&tmp, "webreq.yaml", file_yaml);

    unsafe {
        std::env::set_var("WEBREQ_TEST_DB_PATH", "/tmp/webreq-test.sqlite3");
    }

    let config = ConfigLoader::new()
        .with_file(p)
        .load()
        .expect("load system config");

    unsafe {
        std::env::remove_var("WEBREQ_TEST_DB_PATH");
    }

    assert_eq!(config.database.path, "/tmp/webreq-test.sqlite3");
    assert_eq!(config.defaults.retries, 4);
    assert_eq!(config.domains.len(), 2);
    assert_eq!(config.domains[0].name, "example.com");
    assert_eq!(config.domains[1].timeout_secs, Some(120));
}
