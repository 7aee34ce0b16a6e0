use std::io::Write;

use mplp_core::config::{AgentKind, AppConfig};
use mplp_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
default_retries = 2
default_concurrency = 4
initial_backoff_ms = 50
max_backoff_ms = 800
max_retained_executions = 20

[log]
dir = "/tmp/mplp-test-logs"
level = 3

[[agents]]
id = "fetcher"

[[agents]]
id = "mailer"
kind = "command"
category = "notify"
command = "sendmail"
args = ["-t"]
env = { SMTP_HOST = "localhost" }
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_retries, 2);
    assert_eq!(config.engine.default_concurrency, Some(4));
    assert_eq!(config.engine.initial_backoff_ms, 50);
    assert_eq!(config.engine.max_backoff_ms, 800);
    assert_eq!(config.engine.max_retained_executions, 20);

    let log = config.log.expect("log present");
    assert_eq!(log.level, 3);
    assert_eq!(log.log_dir().to_str(), Some("/tmp/mplp-test-logs"));

    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].kind, AgentKind::Echo);
    let mailer = &config.agents[1];
    assert_eq!(mailer.kind, AgentKind::Command);
    assert_eq!(mailer.category.as_deref(), Some("notify"));
    assert_eq!(mailer.command.as_deref(), Some("sendmail"));
    assert_eq!(mailer.args, vec!["-t"]);
    assert_eq!(mailer.env["SMTP_HOST"], "localhost");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("MPLP_TEST_MAILER_CMD", "/usr/bin/expanded");

    let (_dir, path) = write_config(
        r#"
[[agents]]
id = "mailer"
kind = "command"
command = "${MPLP_TEST_MAILER_CMD}"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");
    assert_eq!(
        config.agents[0].command.as_deref(),
        Some("/usr/bin/expanded")
    );

    std::env::remove_var("MPLP_TEST_MAILER_CMD");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let (_dir, path) = write_config("");

    let config = AppConfig::load(&path).expect("load config");

    assert_eq!(config.engine.default_retries, 0);
    assert!(config.engine.default_concurrency.is_none());
    assert_eq!(config.engine.initial_backoff_ms, 100);
    assert_eq!(config.engine.max_backoff_ms, 5000);
    assert!(config.log.is_none());
    assert!(config.agents.is_empty());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let (_dir, path) = write_config("[engine]\ndefault_concurrency = 0\n");
    assert!(AppConfig::load(&path).is_err());

    let (_dir, path) = write_config("[[agents]]\nid = \"c\"\nkind = \"command\"\n");
    assert!(AppConfig::load(&path).is_err());

    let (_dir, path) = write_config("[[agents]]\nid = \"  \"\n");
    assert!(AppConfig::load(&path).is_err());
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("absent.toml");

    assert!(AppConfig::load(&path).is_err());
    let config = AppConfig::load_or_default(&path).expect("defaults");
    assert!(config.agents.is_empty());
}

#[test]
fn test_demo_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/mplp.toml");
    let config = AppConfig::load(&path).expect("load demo config");
    let ids: Vec<&str> = config.agents.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["fetcher", "analyst", "mailer"]);
}
