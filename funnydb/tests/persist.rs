//! Persist-only mode behaviors: file creation, rotation and directory layout.

use std::fs;
use std::path::{Path, PathBuf};

use funnydb::{Client, Config, Event, Mode, Props};
use serde_json::Value;
use tempdir::TempDir;

fn persist_config(dir: &Path, file_size_mb: u64) -> Config {
    Config {
        mode: Mode::PersistOnly,
        directory: dir.to_path_buf(),
        file_size: file_size_mb,
        ..Config::default()
    }
}

fn test_event() -> Event {
    let mut props = Props::new();
    props.insert("testprop".into(), Value::from("propvalue"));
    Event::new("test-event", props)
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_logs(dir, &mut files);
    files.sort();
    files
}

fn collect_logs(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_logs(&path, out);
        } else if path.extension().map_or(false, |e| e == "log") {
            out.push(path);
        }
    }
}

#[tokio::test]
async fn add_writes_one_line() {
    let dir = TempDir::new("client-persist-test").unwrap();
    let client = Client::new(persist_config(dir.path(), 100)).unwrap();

    client.report_event(test_event()).await.unwrap();
    client.close().await.unwrap();

    let files = log_files(dir.path());
    assert_eq!(1, files.len(), "expected one log file, got {:?}", files);

    let content = fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(1, lines.len());

    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!("Event", record["type"].as_str().unwrap());
    assert_eq!("test-event", record["data"]["#event"].as_str().unwrap());
    assert_eq!("propvalue", record["data"]["testprop"].as_str().unwrap());
}

#[tokio::test]
async fn missing_directories_are_created() {
    let base = TempDir::new("client-persist-test").unwrap();
    let nested = base.path().join("subdir1").join("subdir2");

    let client = Client::new(persist_config(&nested, 100)).unwrap();
    client.report_event(test_event()).await.unwrap();
    client.close().await.unwrap();

    assert_eq!(1, log_files(&nested).len());
}

#[tokio::test]
async fn files_rotate_by_size() {
    let dir = TempDir::new("client-persist-test").unwrap();
    let client = Client::new(persist_config(dir.path(), 1)).unwrap();

    client.report_event(test_event()).await.unwrap();
    let files = log_files(dir.path());
    assert_eq!(1, files.len());
    let single_event_size = fs::metadata(&files[0]).unwrap().len();

    let events_to_overflow = (1024 * 1024 / single_event_size) as usize + 10;
    for _ in 0..events_to_overflow {
        client.report_event(test_event()).await.unwrap();
    }
    client.close().await.unwrap();

    let files = log_files(dir.path());
    assert_eq!(2, files.len(), "expected rotation to a second file, got {:?}", files);
    for file in &files {
        assert!(fs::metadata(file).unwrap().len() <= 1024 * 1024);
    }
}

#[tokio::test]
async fn add_after_close_fails() {
    let dir = TempDir::new("client-persist-test").unwrap();
    let client = Client::new(persist_config(dir.path(), 100)).unwrap();
    client.close().await.unwrap();
    assert!(client.report_event(test_event()).await.is_err());
}

#[tokio::test]
async fn missing_directory_is_a_config_error() {
    let config = Config { mode: Mode::PersistOnly, ..Config::default() };
    assert!(Client::new(config).is_err());
}
