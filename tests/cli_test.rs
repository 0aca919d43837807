//! Drives the `sheetdex` binary against a throwaway configuration.

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("settings.toml");
    let toml = format!(
        r#"
data_dir = "{data}"
index_path = "{index}"

[embedding]
model = "hash"
hash_dimension = 16

[logging]
default = "warn"
"#,
        data = dir.join("data").display(),
        index = dir.join("index").display(),
    );
    std::fs::write(&path, toml).unwrap();
    path
}

fn sheetdex(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sheetdex"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_ingest_then_search_as_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let csv = dir.path().join("fasteners.csv");
    std::fs::write(
        &csv,
        "Part Number,Description\nFS-001,lock washer\nFS-002,cap screw\nFS-003,lock nut\n",
    )
    .unwrap();

    let ingest = sheetdex(&config, &["ingest", csv.to_str().unwrap(), "--json"]);
    assert!(ingest.status.success(), "{}", String::from_utf8_lossy(&ingest.stderr));
    let files: serde_json::Value = serde_json::from_slice(&ingest.stdout).unwrap();
    assert_eq!(files[0]["status"], "completed");
    assert_eq!(files[0]["rows_count"], 3);

    let search = sheetdex(&config, &["search", "lock", "--json"]);
    assert!(search.status.success(), "{}", String::from_utf8_lossy(&search.stderr));
    let page: serde_json::Value = serde_json::from_slice(&search.stdout).unwrap();
    assert_eq!(page["total"], 2);
}

#[test]
fn test_ingest_of_unsupported_file_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, "just some notes").unwrap();

    let output = sheetdex(&config, &["ingest", notes.to_str().unwrap()]);
    assert!(!output.status.success());
}
