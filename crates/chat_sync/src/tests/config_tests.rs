use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_file(contents: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let root = env::temp_dir().join(format!("chat_sync_config_test_{suffix}"));
    fs::create_dir_all(&root).expect("temp root");
    let path = root.join(DEFAULT_SETTINGS_FILE);
    fs::write(&path, contents).expect("write settings");
    path
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn missing_file_yields_defaults() {
    let settings =
        load_settings_from(Path::new("/nonexistent/chat_sync.toml"), no_env).expect("defaults");
    assert_eq!(settings, SyncSettings::default());
    assert_eq!(settings.conversation_poll_interval, Duration::from_secs(3));
    assert_eq!(settings.list_poll_interval, Duration::from_secs(10));
    assert_eq!(settings.read_debounce, Duration::from_millis(500));
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_file(
        "server_url = \"https://chat.example.com/\"\nconversation_poll_ms = 2000\nlist_visibility_threshold = 0.75\n",
    );

    let settings = load_settings_from(&path, no_env).expect("settings");
    assert_eq!(settings.server_url, "https://chat.example.com");
    assert_eq!(settings.conversation_poll_interval, Duration::from_secs(2));
    assert_eq!(settings.list_visibility_threshold, 0.75);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn environment_wins_over_file() {
    let path = temp_settings_file("typing_timeout_ms = 2500\n");
    let vars = HashMap::from([
        ("CHAT_SYNC__TYPING_TIMEOUT_MS".to_string(), "2000".to_string()),
        ("CHAT_SYNC__RECONNECT_MAX_ATTEMPTS".to_string(), "3".to_string()),
    ]);

    let settings = load_settings_from(&path, |key| vars.get(key).cloned()).expect("settings");
    assert_eq!(settings.typing_timeout, Duration::from_secs(2));
    assert_eq!(settings.reconnect_max_attempts, 3);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn rejects_out_of_range_threshold() {
    let vars = HashMap::from([(
        "CHAT_SYNC__DETAIL_VISIBILITY_THRESHOLD".to_string(),
        "1.5".to_string(),
    )]);
    let err = load_settings_from(Path::new("/nonexistent/chat_sync.toml"), |key| {
        vars.get(key).cloned()
    })
    .expect_err("threshold above 1 must fail");
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn rejects_unparseable_numbers() {
    let path = temp_settings_file("list_poll_ms = \"soon\"\n");
    let err = load_settings_from(&path, no_env).expect_err("must fail");
    assert!(err.to_string().contains("list_poll_ms"));
    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn request_timeout_is_configurable_and_non_zero() {
    let path = temp_settings_file("request_timeout_ms = 4000\n");
    let settings = load_settings_from(&path, no_env).expect("settings");
    assert_eq!(settings.request_timeout, Duration::from_secs(4));

    let vars = HashMap::from([("CHAT_SYNC__REQUEST_TIMEOUT_MS".to_string(), "0".to_string())]);
    let err = load_settings_from(&path, |key| vars.get(key).cloned())
        .expect_err("zero timeout must fail");
    assert!(matches!(err, SyncError::Config(_)));
    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}
