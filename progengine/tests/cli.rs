//! CLI tests for the `progengine` binary.
//!
//! Spawns the binary inside a temp dir holding a `progengine.toml` and checks
//! exit codes and the JSON written to stdout.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use progengine::exit_codes;
use progengine::io::config::{EngineConfig, load_config, write_config};

fn progengine(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_progengine"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run progengine")
}

fn write_sources(dir: &Path, main: &str, trigger: &str) {
    fs::write(dir.join("main.sh"), main).expect("write main");
    fs::write(dir.join("cond.sh"), trigger).expect("write trigger");
}

fn configure(dir: &Path, compiler_script: &str, template: Option<&str>) {
    let mut cfg = EngineConfig::default();
    cfg.compiler.command = ["sh", "-c", compiler_script, "scriptc"]
        .map(str::to_string)
        .to_vec();
    if let Some(text) = template {
        fs::write(dir.join("unit.tpl"), text).expect("write template");
        cfg.template_path = Some("unit.tpl".into());
    }
    write_config(&dir.join("progengine.toml"), &cfg).expect("write config");
}

const PROGRAM_ARGS: [&str; 6] = [
    "--address",
    "7",
    "--main",
    "main.sh",
    "--trigger",
    "cond.sh",
];

#[test]
fn config_write_round_trips_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = progengine(temp.path(), &["config", "--write"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let cfg = load_config(&temp.path().join("progengine.toml")).expect("load config");
    assert_eq!(cfg, EngineConfig::default());
}

#[test]
fn compile_errors_exit_with_compile_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    configure(
        temp.path(),
        "echo '{\"line\":0,\"column\":4,\"message\":\"unexpected token\",\"code\":\"E42\"}'; exit 1",
        None,
    );
    write_sources(temp.path(), "x = ;", "true");

    let mut args = vec!["compile"];
    args.extend(PROGRAM_ARGS);
    let output = progengine(temp.path(), &args);

    assert_eq!(output.status.code(), Some(exit_codes::COMPILE_FAILED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("E42"), "stdout: {stdout}");
    assert!(!temp.path().join("programs").join("7.unit").exists());
}

#[test]
fn run_without_artifact_is_not_executed() {
    let temp = tempfile::tempdir().expect("tempdir");
    configure(temp.path(), "exit 1", None);
    write_sources(temp.path(), "echo hi", "true");

    let mut args = vec!["run"];
    args.extend(PROGRAM_ARGS);
    let output = progengine(temp.path(), &args);

    assert_eq!(output.status.code(), Some(exit_codes::NOT_EXECUTED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Program is not compiled."));
}

#[cfg(unix)]
#[test]
fn compile_then_run_shell_unit() {
    let template = r#"#!/bin/sh
main() {
{{program}}
}
condition() {
{{condition}}
}
while IFS= read -r line; do
  case "$line" in
    *'"op":"bind"'*) echo '{"status":"bound","entry":"automation.scripting.ScriptingInstance","capabilities":["set_host","setup","run"]}' ;;
    *'"op":"set_host"'*) echo '{"status":"done"}' ;;
    *'"op":"setup"'*) if condition; then echo '{"status":"ok","return_value":true}'; else echo '{"status":"ok","return_value":false}'; fi ;;
    *'"op":"run"'*) printf '{"status":"ok","return_value":true,"state":"%s"}\n' "$(main)" ;;
  esac
done
"#;
    let temp = tempfile::tempdir().expect("tempdir");
    configure(temp.path(), "cp \"$1\" \"$3\"", Some(template));
    write_sources(temp.path(), "echo lights-on", "true");

    let mut compile = vec!["compile"];
    compile.extend(PROGRAM_ARGS);
    let output = progengine(temp.path(), &compile);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let mut run = vec!["run", "--setup"];
    run.extend(PROGRAM_ARGS);
    let output = progengine(temp.path(), &run);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["method"], "setup");
    assert_eq!(lines[1]["method"], "run");
    assert_eq!(lines[1]["state"], "lights-on");
}
