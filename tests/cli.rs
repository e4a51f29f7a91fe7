use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vigil(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vigil").unwrap();
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

fn workspace(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("vigil.toml"), config).unwrap();
    dir
}

#[test]
fn test_validate_accepts_valid_config() {
    let dir = workspace(
        r#"
        [vigil]
        pool = "threads"
        max_workers = 3

        [[projects]]
        name = "unit"

        [[projects]]
        name = "dom"
        environment = "jsdom"
        "#,
    );

    vigil(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Max workers: 3"))
        .stdout(predicate::str::contains("dom (environment: jsdom, pool: threads)"));
}

#[test]
fn test_validate_rejects_bad_glob() {
    let dir = workspace(
        r#"
        [[projects]]
        name = "unit"
        include = ["src/[unclosed"]
        "#,
    );

    vigil(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid glob"));
}

#[test]
fn test_validate_rejects_duplicate_projects() {
    let dir = workspace(
        r#"
        [[projects]]
        name = "unit"

        [[projects]]
        name = "unit"
        "#,
    );

    vigil(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate project name"));
}

#[test]
fn test_list_shows_environment_and_pool() {
    let dir = workspace(
        r#"
        [vigil]
        pool = "threads"

        [[projects]]
        name = "unit"

        [[projects.pool_match_globs]]
        glob = "native/**"
        pool = "forks"
        "#,
    );
    fs::write(dir.path().join("math.test.ts"), "test('adds', () => {})").unwrap();
    fs::create_dir_all(dir.path().join("native")).unwrap();
    fs::write(
        dir.path().join("native/dom.test.ts"),
        "// @vigil-environment jsdom\ntest('renders', () => {})",
    )
    .unwrap();
    fs::write(dir.path().join("math.ts"), "export {}").unwrap();

    vigil(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Discovered 2 test files"))
        .stdout(predicate::str::contains("[unit] math.test.ts (node, threads)"))
        .stdout(predicate::str::contains("[unit] native/dom.test.ts (jsdom, forks)"))
        .stdout(predicate::str::contains("math.ts (").not());
}

#[test]
fn test_list_json_applies_filters() {
    let dir = workspace(
        r#"
        [[projects]]
        name = "unit"
        "#,
    );
    fs::write(dir.path().join("a.test.ts"), "").unwrap();
    fs::write(dir.path().join("b.test.ts"), "").unwrap();

    let output = vigil(dir.path())
        .args(["list", "--format", "json", "b."])
        .output()
        .unwrap();
    assert!(output.status.success());

    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["path"], "b.test.ts");
    assert_eq!(entries[0]["pool"], "forks");
}

#[test]
fn test_list_rejects_unknown_project() {
    let dir = workspace(
        r#"
        [[projects]]
        name = "unit"
        "#,
    );

    vigil(dir.path())
        .args(["list", "--project", "e2e"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no project named \"e2e\""));
}

#[test]
fn test_init_writes_config_once() {
    let dir = TempDir::new().unwrap();

    vigil(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created vigil.toml"));
    assert!(dir.path().join("vigil.toml").exists());

    vigil(dir.path()).arg("validate").assert().success();

    vigil(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_run_without_tests_honors_pass_with_no_tests() {
    let dir = workspace(
        r#"
        [[projects]]
        name = "unit"
        "#,
    );

    vigil(dir.path()).arg("run").assert().code(1);
    vigil(dir.path())
        .args(["run", "--pass-with-no-tests"])
        .assert()
        .success()
        .stderr(predicate::str::contains("No test files found"));
}
