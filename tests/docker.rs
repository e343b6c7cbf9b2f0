//! End-to-end tests against a real Docker daemon.
//!
//! Ignored by default. Run with `cargo test -- --ignored` on a machine with
//! Docker and the runtime images pulled (`codebox image pull`).

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[allow(deprecated)]
fn codebox_in(dir: &TempDir) -> Command {
    fs::write(
        dir.path().join("codebox.toml"),
        "[history]\nenabled = false\n",
    )
    .unwrap();
    let mut cmd = Command::cargo_bin("codebox").expect("failed to find codebox binary");
    cmd.current_dir(dir.path()).env_remove("CODEBOX_CONFIG");
    cmd
}

fn run_json(dir: &TempDir, language: &str, code: &str) -> serde_json::Value {
    let output = codebox_in(dir)
        .args(["run", "--json", "--language", language, "--code", code])
        .output()
        .unwrap();
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
#[ignore = "requires Docker"]
fn test_python_hello() {
    let dir = TempDir::new().unwrap();
    codebox_in(&dir)
        .args(["run", "--code", "print('hello')"])
        .assert()
        .success()
        .stdout("hello\n");
}

#[test]
#[ignore = "requires Docker"]
fn test_node_hello() {
    let dir = TempDir::new().unwrap();
    let result = run_json(&dir, "node", "console.log(6 * 7)");
    assert_eq!(result["output"], "42\n");
    assert_eq!(result["status"], "success");
}

#[test]
#[ignore = "requires Docker"]
fn test_infinite_loop_times_out() {
    let dir = TempDir::new().unwrap();
    let started = Instant::now();

    let result = run_json(&dir, "python", "while True: pass");

    assert_eq!(result["status"], "timed_out");
    assert_eq!(result["exit_code"], -1);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[test]
#[ignore = "requires Docker"]
fn test_memory_hog_is_killed() {
    let dir = TempDir::new().unwrap();
    // Byte-string repetition writes every page, so the cgroup limit is hit
    // for real instead of the allocator refusing up front
    let code = "chunks = []\nwhile True:\n    chunks.append(b'x' * (16 * 1024 * 1024))";

    let result = run_json(&dir, "python", code);

    assert_eq!(result["status"], "resource_killed");
    assert_eq!(result["exit_code"], 137);
    assert!(result["error"]
        .as_str()
        .unwrap()
        .starts_with("Process killed (likely out of memory"));
}

#[test]
#[ignore = "requires Docker"]
fn test_network_is_blocked() {
    let dir = TempDir::new().unwrap();
    let code = "import urllib.request\nurllib.request.urlopen('http://example.com', timeout=3)";

    let result = run_json(&dir, "python", code);

    assert_eq!(result["status"], "runtime_error");
    assert_ne!(result["exit_code"], 0);
    assert!(!result["error"].as_str().unwrap().is_empty());
}

#[test]
#[ignore = "requires Docker"]
fn test_mount_is_read_only() {
    let dir = TempDir::new().unwrap();
    let result = run_json(&dir, "python", "open('/app/out.txt', 'w').write('x')");
    assert_eq!(result["status"], "runtime_error");
    assert!(result["error"].as_str().unwrap().contains("Read-only file system"));
}

#[test]
#[ignore = "requires Docker"]
fn test_writes_outside_mount_fail() {
    let dir = TempDir::new().unwrap();
    for path in ["/tmp/x", "/etc/x", "/root/x"] {
        let code = format!("open('{path}', 'w').write('x')");

        let result = run_json(&dir, "python", &code);

        assert_eq!(result["status"], "runtime_error", "write to {path} succeeded");
        assert_ne!(result["exit_code"], 0);
        assert!(
            result["error"].as_str().unwrap().contains("Read-only file system"),
            "unexpected error for {path}: {}",
            result["error"]
        );
    }
}

#[test]
#[ignore = "requires Docker"]
fn test_five_print_batch() {
    let dir = TempDir::new().unwrap();
    let tasks: Vec<_> = (1..=5)
        .map(|i| serde_json::json!({ "language": "python", "code": format!("print({i})") }))
        .collect();
    let file = dir.path().join("batch.json");
    fs::write(&file, serde_json::Value::Array(tasks).to_string()).unwrap();

    let output = codebox_in(&dir)
        .args(["batch", "--json", file.to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let results: Vec<serde_json::Value> = serde_json::from_slice(&output).unwrap();
    assert_eq!(results.len(), 5);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result["output"], format!("{}\n", i + 1));
        assert_eq!(result["status"], "success");
    }
}

#[test]
#[ignore = "requires Docker"]
fn test_batch_keeps_order() {
    let dir = TempDir::new().unwrap();
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            serde_json::json!({
                "id": format!("t{i}"),
                "code": format!("import time\ntime.sleep({})\nprint({i})", (8 - i) as f64 / 10.0),
            })
        })
        .collect();
    let file = dir.path().join("batch.json");
    fs::write(&file, serde_json::json!({ "tasks": tasks }).to_string()).unwrap();

    let output = codebox_in(&dir)
        .args(["batch", "--json", file.to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let results: serde_json::Value = serde_json::from_slice(&output).unwrap();
    for i in 0..8 {
        assert_eq!(results[i]["id"], format!("t{i}"));
        assert_eq!(results[i]["output"], format!("{i}\n"));
    }
}

#[test]
#[ignore = "requires Docker"]
fn test_archive_project() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("project.tar");

    let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
    for (name, contents) in [
        ("app/main.py", "from util import greet\nprint(greet())\n"),
        ("app/util.py", "def greet():\n    return 'hi from util'\n"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    builder.finish().unwrap();

    codebox_in(&dir)
        .args(["run-archive", archive.to_str().unwrap(), "--entry", "app/main.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi from util"));
}

#[test]
#[ignore = "requires Docker"]
fn test_zip_project() {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("project.zip");

    let mut writer = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
    for (name, contents) in [
        ("src/index.js", "const { greet } = require('./greet');\nconsole.log(greet());\n"),
        ("src/greet.js", "exports.greet = () => 'hi from zip';\n"),
    ] {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap();

    codebox_in(&dir)
        .args(["run-archive", archive.to_str().unwrap(), "--entry", "src/index.js"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi from zip"));
}
