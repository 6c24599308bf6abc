//! CLI smoke tests: every command parses, fails helpfully without a
//! config, and the build path works end to end in a temp prefix.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn nimbus() -> Command {
  Command::cargo_bin("nimbus").unwrap()
}

/// A config with one sourceless package and one environment, prefix
/// pointed inside the temp directory.
fn write_project(temp: &TempDir) {
  let prefix = temp.path().join("prefix");
  std::fs::write(
    temp.path().join("config.yaml"),
    format!(
      r#"
paths:
  prefix: {}
  store: versions/.store
builds:
  - name: solver
    version: "1.0.0"
envs:
  - name: solver
    dest: versions
links:
  versions:
    latest: "1.0.0-1"
"#,
      prefix.display()
    ),
  )
  .unwrap();

  let scripts = temp.path().join("scripts");
  std::fs::create_dir_all(&scripts).unwrap();
  let script = scripts.join("build_solver.sh");
  std::fs::write(
    &script,
    "#!/bin/sh\nmkdir -p \"$out/bin\"\necho ok > \"$out/bin/solver\"\n",
  )
  .unwrap();
  let mut perms = std::fs::metadata(&script).unwrap().permissions();
  perms.set_mode(0o755);
  std::fs::set_permissions(&script, perms).unwrap();
}

#[test]
fn help_flag_works() {
  nimbus()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  nimbus().arg("--version").assert().success();
}

#[test]
fn missing_config_is_a_named_error() {
  let temp = TempDir::new().unwrap();
  nimbus()
    .current_dir(temp.path())
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("config.yaml"));
}

#[test]
fn build_then_links_end_to_end() {
  let temp = TempDir::new().unwrap();
  write_project(&temp);

  nimbus()
    .current_dir(temp.path())
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("environment created"));

  let env = temp.path().join("prefix/versions/1.0.0-1");
  assert!(env.join("manifest").is_file());
  assert!(env.join("bin/solver").exists());

  // Second build is a no-op
  nimbus()
    .current_dir(temp.path())
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("already exists"));

  nimbus()
    .current_dir(temp.path())
    .arg("links")
    .assert()
    .success();
  let latest = temp.path().join("prefix/versions/latest");
  assert!(latest.symlink_metadata().unwrap().file_type().is_symlink());
  assert_eq!(
    std::fs::read_link(&latest).unwrap(),
    Path::new("1.0.0-1")
  );
}

#[test]
fn missing_build_script_names_the_package() {
  let temp = TempDir::new().unwrap();
  write_project(&temp);
  std::fs::remove_file(temp.path().join("scripts/build_solver.sh")).unwrap();

  nimbus()
    .current_dir(temp.path())
    .arg("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("solver"));
}

#[test]
fn sync_dry_run_prints_commands() {
  let temp = TempDir::new().unwrap();
  write_project(&temp);

  // Append an area; sync itself stays a dry run
  let config_path = temp.path().join("config.yaml");
  let mut config = std::fs::read_to_string(&config_path).unwrap();
  config.push_str("areas:\n  - name: bergen\n    host: be-grid01.example.com\n");
  std::fs::write(&config_path, config).unwrap();

  nimbus()
    .current_dir(temp.path())
    .arg("build")
    .assert()
    .success();

  nimbus()
    .current_dir(temp.path())
    .args(["sync", "--dry-run"])
    .assert()
    .success()
    .stdout(predicate::str::contains("rsync"))
    .stdout(predicate::str::contains("be-grid01.example.com"));
}

#[test]
fn sync_refuses_unbuilt_packages() {
  let temp = TempDir::new().unwrap();
  write_project(&temp);

  nimbus()
    .current_dir(temp.path())
    .args(["sync", "--dry-run"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("installed"));
}

#[test]
fn update_unknown_package_fails() {
  let temp = TempDir::new().unwrap();
  write_project(&temp);

  nimbus()
    .current_dir(temp.path())
    .args(["update", "ghost", "main", "--yes"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("ghost"));
}
