use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use designsync::load_config::load_config;

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

#[test]
fn test_load_config_full() {
    let file = config_file(
        r#"
file_id: "abc123"
output_dir: ./out/icons
priority: 2
components: false
collection: "Colors"
"#,
    );

    let config = load_config(file.path()).expect("Config should load");
    assert_eq!(config.file_id, "abc123");
    assert_eq!(config.output_dir, PathBuf::from("./out/icons"));
    assert_eq!(config.priority, 2);
    assert!(!config.components);
    assert_eq!(config.collection.as_deref(), Some("Colors"));
}

#[test]
fn test_load_config_defaults() {
    let file = config_file("file_id: abc123\noutput_dir: ./out\n");

    let config = load_config(file.path()).expect("Config should load");
    assert_eq!(config.priority, 0);
    assert!(config.components);
    assert!(config.collection.is_none());
}

#[test]
fn test_load_config_rejects_config_that_exports_nothing() {
    let file = config_file("file_id: abc123\noutput_dir: ./out\ncomponents: false\n");

    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("exports nothing"));
}

#[test]
fn test_load_config_rejects_empty_file_id() {
    let file = config_file("file_id: \"  \"\noutput_dir: ./out\n");
    assert!(load_config(file.path()).is_err());
}

#[test]
fn test_load_config_missing_field() {
    let file = config_file("output_dir: ./out\n");

    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config YAML"));
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
