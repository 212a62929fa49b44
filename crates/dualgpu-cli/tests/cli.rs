//! End-to-end tests for the `dualgpu` binary using the mock backend.

use assert_cmd::Command;
use predicates::prelude::*;

fn dualgpu(db_dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dualgpu").unwrap();
    cmd.env(
        "DUALGPU_BENCHMARK_DB",
        format!("sqlite:{}", db_dir.path().join("bench.db").display()),
    )
    .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_config_honours_legacy_variables() {
    let dir = tempfile::tempdir().unwrap();
    dualgpu(&dir)
        .env("DUALGPUOPT_ENGINE_CACHE_SIZE", "5")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""capacity": 5"#));
}

#[test]
fn test_config_nested_env_override() {
    let dir = tempfile::tempdir().unwrap();
    dualgpu(&dir)
        .env("DUALGPU_POOL__CAPACITY", "4")
        .env("DUALGPU_POOL__HEALTH_FAILURE_THRESHOLD", "6")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""capacity": 4"#))
        .stdout(predicate::str::contains(r#""health_failure_threshold": 6"#));
}

#[test]
fn test_config_file_is_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dualgpu.toml");
    std::fs::write(&path, "metrics_port = 9108\n\n[pool]\nhealth_failure_threshold = 4\n").unwrap();

    dualgpu(&dir)
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""health_failure_threshold": 4"#))
        .stdout(predicate::str::contains(r#""metrics_port": 9108"#));
}

#[test]
fn test_run_records_benchmark() {
    let dir = tempfile::tempdir().unwrap();
    dualgpu(&dir)
        .args(["-o", "json", "run", "/models/tiny", "--backend", "mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Response to: Hello, how are you"))
        .stdout(predicate::str::contains(r#""model": "/models/tiny@mock""#));

    dualgpu(&dir)
        .args(["-o", "json", "bench", "recent", "/models/tiny@mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tokens_per_second"));

    dualgpu(&dir)
        .args(["bench", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 1 records"));
}

#[test]
fn test_run_rejects_malformed_param() {
    let dir = tempfile::tempdir().unwrap();
    dualgpu(&dir)
        .args(["run", "/models/tiny", "--backend", "mock", "-p", "oops"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("key=value"));
}

#[test]
fn test_run_rejects_unknown_backend() {
    let dir = tempfile::tempdir().unwrap();
    dualgpu(&dir)
        .args(["run", "/models/tiny", "--backend", "tensorrt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend kind"));
}
