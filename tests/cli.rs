//! CLI test cases.
//!
//! Most of these use the `echo` engine, which "recognizes" a file by reading
//! it as UTF-8 text, so they run anywhere. Tests which need a real Tesseract
//! install are ignored by default.

use std::{path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("ocr-pool").unwrap();
    // Don't let a developer's `.env` change our results.
    for var in [
        "OCR_POOL_ENGINE",
        "OCR_POOL_WORKERS",
        "OCR_POOL_LANGUAGES",
        "OCR_POOL_TIMEOUT",
        "OCR_POOL_STORE_DIR",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Run an `images` subcommand against `store` and parse the JSON response.
fn images(store: &Path, args: &[&str]) -> (bool, Value) {
    let output = cmd()
        .arg("images")
        .arg("--store-dir")
        .arg(store)
        .args(args)
        .output()
        .unwrap();
    let response = serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "bad JSON response ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    });
    (output.status.success(), response)
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_ocr_echo() {
    let output = cmd()
        .args(["ocr", "--engine", "echo", "--workers", "2"])
        .arg("tests/fixtures/hello.txt")
        .arg("tests/fixtures/hello.txt")
        .output()
        .unwrap();
    assert!(output.status.success());

    let records = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record["image"], "tests/fixtures/hello.txt");
        assert_eq!(record["status"], "ok");
        assert_eq!(record["text"].as_str().unwrap().trim(), "HELLO");
    }
}

#[test]
fn test_ocr_failure_rate() {
    // One failure out of two is too many by default...
    cmd()
        .args(["ocr", "--engine", "echo"])
        .arg("tests/fixtures/hello.txt")
        .arg("tests/fixtures/fail.txt")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"status\":\"failed\""))
        .stderr(predicate::str::contains("could not be recognized"));

    // ...unless we allow it.
    cmd()
        .args(["ocr", "--engine", "echo", "--allowed-failure-rate", "0.5"])
        .arg("tests/fixtures/hello.txt")
        .arg("tests/fixtures/fail.txt")
        .assert()
        .success();
}

#[test]
fn test_ocr_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.jsonl");
    cmd()
        .args(["ocr", "--engine", "echo", "--out"])
        .arg(&out)
        .arg("tests/fixtures/hello.txt")
        .assert()
        .success();
    let written = std::fs::read_to_string(&out).unwrap();
    assert!(written.contains("HELLO"));
}

#[test]
fn test_ocr_rejects_bad_languages() {
    cmd()
        .args(["ocr", "--engine", "echo", "--lang", "eng+fra"])
        .arg("tests/fixtures/hello.txt")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid language code"));
}

#[test]
fn test_images_round_trip_echo() {
    let store = tempfile::tempdir().unwrap();

    let (ok, uploaded) = images(store.path(), &["upload", "tests/fixtures/hello.png"]);
    assert!(ok, "{uploaded}");
    assert_eq!(uploaded["message"], "Success");
    let id = uploaded["result"]["id"].as_str().unwrap().to_owned();
    assert!(id.starts_with("uploads/"));
    assert_eq!(uploaded["result"]["format"], "png");

    let (ok, listed) = images(store.path(), &["list"]);
    assert!(ok);
    assert_eq!(listed["result"][0]["id"], id.as_str());

    // `:` works as a folder separator.
    let cli_id = id.replace('/', ":");
    let (ok, found) = images(store.path(), &["get", &cli_id, "--engine", "echo"]);
    assert!(ok, "{found}");
    assert_eq!(found["result"]["id"], id.as_str());
    assert!(found["result"]["text"].is_string());

    let (ok, _) = images(store.path(), &["delete", &cli_id]);
    assert!(ok);

    let (ok, missing) = images(store.path(), &["get", &cli_id, "--engine", "echo"]);
    assert!(!ok);
    assert_eq!(missing["message"], "Error");
    assert_eq!(missing["status"], 404);
}

#[test]
fn test_images_rejects_non_images() {
    let store = tempfile::tempdir().unwrap();
    let (ok, response) = images(store.path(), &["upload", "tests/fixtures/hello.txt"]);
    assert!(!ok);
    assert_eq!(response["message"], "Error");
    assert_eq!(response["status"], 400);

    let (ok, listed) = images(store.path(), &["list"]);
    assert!(ok);
    assert_eq!(listed["result"], serde_json::json!([]));
}

#[test]
fn test_schema() {
    for schema_type in ["RecognitionResult", "OcrRecord", "StoredImage", "ImageWithText"] {
        cmd()
            .args(["schema", schema_type])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"properties\""));
    }
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_ocr_tesseract() {
    cmd()
        .args(["ocr", "tests/fixtures/hello.png"])
        .assert()
        .success()
        .stdout(predicate::str::contains("HELLO"));
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_images_get_tesseract() {
    let store = tempfile::tempdir().unwrap();
    let (ok, uploaded) = images(store.path(), &["upload", "tests/fixtures/hello.png"]);
    assert!(ok);
    let id = uploaded["result"]["id"].as_str().unwrap().to_owned();

    let (ok, found) = images(store.path(), &["get", &id]);
    assert!(ok, "{found}");
    let text = found["result"]["text"].as_str().unwrap();
    assert_eq!(text.split_whitespace().collect::<String>().to_uppercase(), "HELLO");
}
