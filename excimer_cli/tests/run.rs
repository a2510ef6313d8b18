use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::path;
use predicates::str;

mod common;

#[test]
fn run_writes_results_and_summary_files() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("parameters.txt");
    file.write_str(&common::parameter_file()).unwrap();

    Command::cargo_bin("excimer")
        .unwrap()
        .args(["--quiet", "--workers", "2", "--seed", "42", "run"])
        .arg(file.path())
        .arg("--output-dir")
        .arg(dir.path())
        .assert()
        .success();

    dir.child("results0.txt")
        .assert(path::exists())
        .assert(str::contains("Exciton diffusion test results:"))
        .assert(str::contains("4 excitons have been created."));
    dir.child("results1.txt").assert(path::exists());
    dir.child("analysis_summary.txt")
        .assert(str::contains("Simulation was performed on 2 workers."))
        .assert(str::contains("8 total excitons tested."))
        .assert(str::contains("Exciton diffusion length is"));
}

#[test]
fn run_is_reproducible_for_equal_seeds() {
    let dir = assert_fs::TempDir::new().unwrap();
    let file = dir.child("parameters.txt");
    file.write_str(&common::parameter_file()).unwrap();

    for out in ["first", "second"] {
        let out_dir = dir.child(out);
        out_dir.create_dir_all().unwrap();
        Command::cargo_bin("excimer")
            .unwrap()
            .args(["--quiet", "--seed", "7", "run"])
            .arg(file.path())
            .arg("--output-dir")
            .arg(out_dir.path())
            .assert()
            .success();
    }

    let read = |name: &str| std::fs::read_to_string(dir.child(name).path()).unwrap();
    let strip_timing = |text: String| {
        text.lines()
            .filter(|line| !line.contains("time"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    assert_eq!(
        strip_timing(read("first/results0.txt")),
        strip_timing(read("second/results0.txt"))
    );
}

#[test]
fn run_fails_on_a_missing_parameter_file() {
    Command::cargo_bin("excimer")
        .unwrap()
        .args(["--quiet", "run", "does_not_exist.txt"])
        .assert()
        .failure()
        .stderr(str::contains("unable to open"));
}
