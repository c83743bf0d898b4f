use std::path::Path;
use std::process::{Command, Output};

use fs_err as fs;
use serde_json::{json, Value};
use tempfile::TempDir;

const NOW: i64 = 1_710_000_000_000;

const DUMP: &str = "\"main\" prio=5 tid=1 Blocked\n  at com.example.Worker.run(Worker.java:42)\n";

fn vigil(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vigil"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("VIGIL_DEBUG_LOG")
        .output()
        .expect("Failed to run vigil")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "vigil failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

fn write_history(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("history.json");
    let document = json!({
        "version": 1,
        "records": [
            {
                "timestamp": NOW - 60_000,
                "reason": "hang",
                "importance": "foreground",
                "diagnostic": { "inline": DUMP },
            },
            { "timestamp": NOW - 90_000, "reason": "low_memory" },
        ],
    });
    fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
    path
}

fn category<'a>(summary: &'a Value, name: &str) -> &'a Value {
    summary["categories"]
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["category"] == name)
        .unwrap()
}

#[test]
fn test_reconcile_reports_once_and_moves_marker() {
    let temp = TempDir::new().unwrap();
    let history = write_history(temp.path());
    let now = NOW.to_string();
    let args = [
        "reconcile",
        "--history",
        history.to_str().unwrap(),
        "--now-ms",
        now.as_str(),
    ];

    let first = stdout_json(&vigil(temp.path(), &args));
    let hang = category(&first, "hang");
    assert_eq!(hang["outcome"], "processed");
    assert_eq!(hang["reports"][0]["timestamp"], NOW - 60_000);
    assert!(hang["reports"][0]["event_id"].is_string());
    assert_eq!(category(&first, "native_fault")["outcome"], "nothing_new");

    let markers = stdout_json(&vigil(temp.path(), &["markers"]));
    let hang_marker = markers["markers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|marker| marker["category"] == "hang")
        .unwrap();
    assert_eq!(hang_marker["timestamp_ms"], NOW - 60_000);

    let second = stdout_json(&vigil(temp.path(), &args));
    assert_eq!(category(&second, "hang")["outcome"], "nothing_new");
}

#[test]
fn test_reconcile_missing_history_is_empty() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("absent.json");
    let summary = stdout_json(&vigil(
        temp.path(),
        &["reconcile", "--history", missing.to_str().unwrap()],
    ));
    assert_eq!(category(&summary, "hang")["outcome"], "nothing_new");
}

#[test]
fn test_reconcile_rejects_unsupported_history_version() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("history.json");
    fs::write(&path, r#"{"version":99,"records":[]}"#).unwrap();

    let output = vigil(
        temp.path(),
        &["reconcile", "--history", path.to_str().unwrap()],
    );
    assert!(!output.status.success());
}

#[test]
fn test_watch_reports_a_stalled_main_loop_once() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("vigil.toml"),
        "[watchdog]\ninterval_ms = 100\nreport_in_debug = true\n",
    )
    .unwrap();

    let summary = stdout_json(&vigil(
        temp.path(),
        &["watch", "--stall-ms", "700", "--duration-ms", "1500"],
    ));
    assert_eq!(summary["watchdog"], "ran");
    assert_eq!(summary["hangs"], 1);
}

#[test]
fn test_watch_respects_disabled_watchdog() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("vigil.toml"),
        "[watchdog]\nenabled = false\n",
    )
    .unwrap();

    let summary = stdout_json(&vigil(temp.path(), &["watch", "--duration-ms", "10"]));
    assert_eq!(summary["watchdog"], "disabled");
}

#[test]
fn test_malformed_config_falls_back_to_defaults() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("vigil.toml"), "[watchdog\ninterval_ms = ").unwrap();

    let summary = stdout_json(&vigil(temp.path(), &["markers"]));
    assert_eq!(summary["markers"].as_array().unwrap().len(), 2);
}
