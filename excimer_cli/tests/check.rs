use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::str;

mod common;

#[test]
fn check_accepts_a_valid_parameter_file() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("parameters.txt");
    file.write_str(&common::parameter_file()).unwrap();

    Command::cargo_bin("excimer")
        .unwrap()
        .args(["--quiet", "check"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(str::contains("valid parameter file"))
        .stdout(str::contains("exciton diffusion"));
}

#[test]
fn check_rejects_a_truncated_parameter_file() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("parameters.txt");
    let mut content = common::parameter_file();
    content.truncate(content.rfind('\n').unwrap());
    file.write_str(&content).unwrap();

    Command::cargo_bin("excimer")
        .unwrap()
        .args(["--quiet", "check"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(str::contains("coulomb_cutoff"));
}

#[test]
fn check_rejects_a_conflicting_test_selection() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("parameters.txt");
    let content = common::parameter_file().replace("false / IQE test", "true / IQE test");
    file.write_str(&content).unwrap();

    Command::cargo_bin("excimer")
        .unwrap()
        .args(["--quiet", "check"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(str::contains("test_selection"));
}
