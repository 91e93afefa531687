//! End-to-end runs through the external compiler and child-process units.
//!
//! The wrapper template here is itself a `/bin/sh` unit that speaks the
//! JSON-lines protocol, and the "compiler" copies the composed text to the
//! output path. That exercises composition, staging, commit, snapshotting and
//! binding without any real toolchain.
#![cfg(unix)]

use std::fs;

use progengine::engine::{ProgramEngine, UnitState};
use progengine::io::compiler::CommandCompiler;
use progengine::io::loader::ProcessLoader;
use progengine::program::ProgramBlock;
use progengine::test_support::TestEnv;

const SHELL_UNIT: &str = r#"#!/bin/sh
main() {
{{program}}
}
condition() {
{{condition}}
}
while IFS= read -r line; do
  case "$line" in
    *'"op":"bind"'*) echo '{"status":"bound","entry":"automation.scripting.ScriptingInstance","capabilities":["set_host","setup","run","reset"]}' ;;
    *'"op":"set_host"'*) echo '{"status":"done"}' ;;
    *'"op":"setup"'*)
      if condition >/dev/null; then
        echo '{"status":"ok","return_value":true}'
      else
        echo '{"status":"ok","return_value":false}'
      fi ;;
    *'"op":"run"'*) printf '{"status":"ok","return_value":true,"state":"%s"}\n' "$(main)" ;;
    *'"op":"reset"'*) echo '{"status":"done"}' ;;
  esac
done
"#;

type ShellEngine = ProgramEngine<CommandCompiler, ProcessLoader>;

fn shell_env() -> TestEnv {
    let env = TestEnv::with_template(SHELL_UNIT).expect("env");
    assert!(env.env().template().main_offset() > 0);
    env
}

fn shell_engine(env: &TestEnv, block: ProgramBlock) -> ShellEngine {
    let environment = env.env();
    let cfg = environment.config();
    let compiler = CommandCompiler::new(&progengine::io::config::CompilerConfig {
        command: ["sh", "-c", "cp \"$1\" \"$3\"", "scriptc"]
            .map(str::to_string)
            .to_vec(),
        ..cfg.compiler.clone()
    });
    let loader = ProcessLoader::new(
        environment.shadow_dir().to_path_buf(),
        cfg.artifact_extension.clone(),
    );
    ProgramEngine::new(environment.clone(), block.into_handle(), compiler, loader)
}

#[test]
fn shell_unit_compiles_binds_and_runs() {
    let env = shell_env();
    let block = ProgramBlock::new("7", "echo lights-on").with_trigger("true");
    let mut engine = shell_engine(&env, block);

    assert_eq!(engine.compile(), Vec::new());
    let artifact = env.artifact_path("7").expect("path");
    assert!(fs::read_to_string(&artifact).expect("artifact").contains("echo lights-on"));

    assert!(engine.load());
    let setup = engine.setup().expect("setup").expect("result");
    assert!(setup.return_value);
    let run = engine.run("").expect("run").expect("result");
    assert_eq!(run.state, serde_json::json!("lights-on"));
    assert_eq!(engine.state(), UnitState::LoadedBound);

    let generation = engine.generation().expect("bound");
    let snapshot = env
        .env()
        .shadow_dir()
        .join("7")
        .join(format!("{generation}.unit"));
    assert!(snapshot.is_file());
    engine.unload();
    assert!(!snapshot.exists());
}

#[test]
fn false_condition_declines_activation() {
    let env = shell_env();
    let block = ProgramBlock::new("8", "echo idle").with_trigger("false");
    let mut engine = shell_engine(&env, block);
    assert!(engine.compile().is_empty());
    assert!(engine.load());

    let setup = engine.setup().expect("setup").expect("result");
    assert!(!setup.return_value);
    assert!(engine.program().snapshot().activation_time.is_none());
}

#[test]
fn running_unit_survives_recompile_until_reload() {
    let env = shell_env();
    let block = ProgramBlock::new("9", "echo lights-on").with_trigger("true");
    let mut engine = shell_engine(&env, block);
    assert!(engine.compile().is_empty());
    assert!(engine.load());
    assert_eq!(
        engine.run("").expect("run").expect("result").state,
        serde_json::json!("lights-on")
    );

    engine.program().lock().script_source = "echo lights-off".to_string();
    assert!(engine.compile().is_empty());
    assert_eq!(
        engine.run("").expect("run").expect("result").state,
        serde_json::json!("lights-on")
    );

    assert!(engine.load());
    assert_eq!(
        engine.run("").expect("run").expect("result").state,
        serde_json::json!("lights-off")
    );
}
