use sheetdex::Settings;
use std::env;
use tempfile::TempDir;

// Environment variables are process-wide, so every override is checked in a
// single test to keep parallel tests from seeing each other's values.
#[test]
fn test_env_overrides_file_and_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("settings.toml");
    std::fs::write(
        &config_path,
        r#"
[intake]
chunk_threshold_bytes = 1048576
max_chunk_size = 65536

[query]
default_page_size = 10
"#,
    )
    .unwrap();

    unsafe {
        // Double underscore separates nested levels
        env::set_var("SHEETDEX_INTAKE__CHUNK_THRESHOLD_BYTES", "2097152");
        env::set_var("SHEETDEX_EMBEDDING__MODEL", "hash");
        env::set_var("SHEETDEX_INDEX__PURGE_ON_FAILURE", "false");
    }

    let settings = Settings::load_from(&config_path).unwrap();

    unsafe {
        env::remove_var("SHEETDEX_INTAKE__CHUNK_THRESHOLD_BYTES");
        env::remove_var("SHEETDEX_EMBEDDING__MODEL");
        env::remove_var("SHEETDEX_INDEX__PURGE_ON_FAILURE");
    }

    // Env beats file
    assert_eq!(settings.intake.chunk_threshold_bytes, 2 * 1024 * 1024);
    // File beats defaults
    assert_eq!(settings.intake.max_chunk_size, 65536);
    assert_eq!(settings.query.default_page_size, 10);
    assert_eq!(settings.embedding.model, "hash");
    assert!(!settings.index.purge_on_failure);
    // Untouched defaults survive
    assert_eq!(settings.parsing.batch_size, 1000);
    assert_eq!(settings.query.max_page_size, 100);
}

#[test]
fn test_missing_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::load_from(temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings.intake.max_upload_bytes, 2 * 1024 * 1024 * 1024);
    assert_eq!(settings.index.max_retries, 5);
}
