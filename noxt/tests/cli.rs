//! End-to-end tests driving the `noxt` binary as a real subprocess.

use std::io::Write;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::{Builder, NamedTempFile};

fn script_file(source: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(".nox").tempfile().unwrap();
    write!(file, "{source}").unwrap();
    file
}

#[test]
fn runs_a_script_and_exits_zero() {
    let file = script_file("print 1 + 2;");
    Command::cargo_bin("noxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("3"));
}

#[test]
fn compile_error_exits_65() {
    let file = script_file("var = ;");
    Command::cargo_bin("noxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(65);
}

#[test]
fn runtime_error_exits_70() {
    let file = script_file("print undefined_name;");
    Command::cargo_bin("noxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(70);
}

#[test]
fn missing_file_is_reported_and_exits_nonzero() {
    Command::cargo_bin("noxt")
        .unwrap()
        .arg("/nonexistent/path/to/script.nox")
        .assert()
        .failure()
        .stderr(contains("noxt:"));
}

#[test]
fn classes_and_inheritance_run_end_to_end() {
    let file = script_file(
        r#"
        class Animal {
            speak() {
                print "...";
            }
        }
        class Dog < Animal {
            speak() {
                print "Woof";
            }
        }
        Dog().speak();
        "#,
    );
    Command::cargo_bin("noxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("Woof"));
}

#[test]
fn list_builtins_append_and_delete() {
    let file = script_file(
        r#"
        var xs = [1, 2, 3];
        append(xs, 4);
        print xs[3];
        print delete(xs, 0);
        print xs[0];
        "#,
    );
    Command::cargo_bin("noxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("4"))
        .stdout(contains("nil"))
        .stdout(contains("2"));
}

#[test]
fn gc_stress_flag_does_not_break_execution() {
    let file = script_file(
        r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
        "#,
    );
    Command::cargo_bin("noxt")
        .unwrap()
        .arg("--gc-stress")
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("55"));
}

#[test]
fn invalid_config_path_is_reported() {
    let file = script_file("print 1;");
    Command::cargo_bin("noxt")
        .unwrap()
        .arg("--config")
        .arg("/nonexistent/noxt.toml")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(contains("configuration"));
}
