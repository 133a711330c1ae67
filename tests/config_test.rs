use secrecy::ExposeSecret;
use snappea::config::{Config, FileConfig};
use std::io::Write;
use std::time::Duration;

const VARS: &[&str] = &[
    "QUEUE_DATABASE_URL",
    "SNAPPEA_SLOTS",
    "SNAPPEA_LEASE_SECS",
    "SNAPPEA_POLL_INTERVAL_MS",
];

fn clear_env() {
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
}

// Environment-driven cases share one test so they don't race on process env.
#[test]
fn config_from_env() {
    clear_env();
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("QUEUE_DATABASE_URL", "postgres://snappea:pw@localhost/queue");
        std::env::set_var("SNAPPEA_SLOTS", "6");
        std::env::set_var("SNAPPEA_LEASE_SECS", "90");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(
        config.queue_database_url.expose_secret(),
        "postgres://snappea:pw@localhost/queue"
    );
    assert_eq!(config.slots, 6);
    assert_eq!(config.lease_duration, Duration::from_secs(90));
    assert!(!config.log_level.is_empty());

    let runner = config.runner_config();
    assert_eq!(runner.slots, 6);
    assert_eq!(runner.renew_interval, Duration::from_secs(30));

    unsafe {
        std::env::set_var("SNAPPEA_POLL_INTERVAL_MS", "soon");
    }
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn file_values_apply_under_lookup() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        queue_database_url = "postgres://file/queue"
        slots = 2
        backoff_base_ms = 250
        backoff_cap_ms = 5000
        tasks_dir = "/etc/snappea/tasks"
        "#
    )
    .unwrap();

    let parsed = FileConfig::read(file.path()).unwrap();
    let config = Config::from_sources(parsed, |name| match name {
        "SNAPPEA_SLOTS" => Some("3".to_string()),
        _ => None,
    })
    .unwrap();

    assert_eq!(config.slots, 3);
    assert_eq!(config.tasks_dir.to_str(), Some("/etc/snappea/tasks"));
    let backoff = config.backoff();
    assert_eq!(backoff.base, Duration::from_millis(250));
    assert_eq!(backoff.cap, Duration::from_secs(5));
}

#[test]
fn debug_output_hides_the_database_url() {
    let config = Config::from_sources(FileConfig::default(), |name| {
        (name == "QUEUE_DATABASE_URL").then(|| "postgres://u:hunter2@db/queue".to_string())
    })
    .unwrap();
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn unreadable_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = FileConfig::read(&dir.path().join("missing.toml"));
    assert!(matches!(result, Err(snappea::error::Error::Config(_))));
}
