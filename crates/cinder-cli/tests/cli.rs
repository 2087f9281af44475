//! End-to-end driver tests: exit codes and output contracts

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn cinder() -> Command {
    Command::cargo_bin("cinder").expect("binary built")
}

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

#[test]
fn test_success_prints_and_exits_zero() {
    let file = script("print 1 + 2 * 3;");
    cinder()
        .arg(file.path())
        .assert()
        .success()
        .stdout("7\n");
}

#[test]
fn test_compile_error_exits_65() {
    let file = script("var = 1;");
    cinder()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("[line 1] Error at '='"));
}

#[test]
fn test_runtime_error_exits_70_with_trace() {
    let file = script("fun f() { return missing; }\nf();");
    cinder()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable 'missing'."))
        .stderr(predicate::str::contains("[line 1] in f()"))
        .stderr(predicate::str::contains("[line 2] in script"));
}

#[test]
fn test_missing_file_exits_74() {
    cinder().arg("no-such-file.cin").assert().code(74);
}

#[test]
fn test_extra_arguments_are_a_usage_error() {
    cinder().args(["one.cin", "two.cin"]).assert().code(64);
}

#[test]
fn test_disasm_prints_bytecode() {
    let file = script("print 1;");
    cinder()
        .arg("--disasm")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("== <script> =="))
        .stdout(predicate::str::contains("Print"));
}

#[test]
fn test_json_diagnostics() {
    let file = script("var = 1;");
    cinder()
        .arg("--json")
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("\"message\""));
}
