//! Command-line front end for the program engine.
//!
//! Compiles a program from its fragment files into the programs directory,
//! or loads the committed artifact and drives `setup`/`run` once.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use progengine::core::types::ProgramError;
use progengine::engine::ProgramEngine;
use progengine::exit_codes;
use progengine::io::compiler::CommandCompiler;
use progengine::io::config::{EngineConfig, load_config, write_config};
use progengine::io::environment::Environment;
use progengine::io::loader::ProcessLoader;
use progengine::logging;
use progengine::program::ProgramBlock;

#[derive(Parser)]
#[command(
    name = "progengine",
    version,
    about = "Compile, load and run automation programs"
)]
struct Cli {
    /// Engine configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "progengine.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ProgramArgs {
    /// Program address; names the committed artifact.
    #[arg(long)]
    address: String,
    /// File holding the main program body.
    #[arg(long)]
    main: PathBuf,
    /// File holding the trigger condition.
    #[arg(long)]
    trigger: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a program and commit its artifact.
    Compile {
        #[command(flatten)]
        program: ProgramArgs,
    },
    /// Load the committed artifact and invoke it.
    Run {
        #[command(flatten)]
        program: ProgramArgs,
        /// Options string passed to `run`.
        #[arg(long, default_value = "")]
        options: String,
        /// Evaluate `setup` first and skip `run` when it returns false.
        #[arg(long)]
        setup: bool,
    },
    /// Print the effective configuration.
    Config {
        /// Write it to the config path instead.
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Compile { program } => cmd_compile(cfg_root(cfg, &cli.config), &program),
        Command::Run {
            program,
            options,
            setup,
        } => cmd_run(cfg_root(cfg, &cli.config), &program, &options, setup),
        Command::Config { write } => cmd_config(&cli.config, &cfg, write),
    }
}

/// Relative directories in the config are resolved next to the config file.
fn cfg_root(cfg: EngineConfig, config_path: &Path) -> EngineConfig {
    match config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(base) => cfg.rooted_at(base),
        None => cfg,
    }
}

type CliEngine = ProgramEngine<CommandCompiler, ProcessLoader>;

fn build_engine(cfg: EngineConfig, args: &ProgramArgs) -> Result<CliEngine> {
    let main = fs::read_to_string(&args.main)
        .with_context(|| format!("read main body {}", args.main.display()))?;
    let mut block = ProgramBlock::new(args.address.clone(), main);
    if let Some(path) = &args.trigger {
        let trigger = fs::read_to_string(path)
            .with_context(|| format!("read trigger condition {}", path.display()))?;
        block = block.with_trigger(trigger);
    }
    block.is_enabled = true;

    let compiler = CommandCompiler::new(&cfg.compiler);
    let env = Environment::init(cfg)?;
    let loader = ProcessLoader::new(
        env.shadow_dir().to_path_buf(),
        env.config().artifact_extension.clone(),
    );
    Ok(ProgramEngine::new(env, block.into_handle(), compiler, loader))
}

fn cmd_compile(cfg: EngineConfig, args: &ProgramArgs) -> Result<i32> {
    let mut engine = build_engine(cfg, args)?;
    let errors = engine.compile();
    for error in &errors {
        print_json(error)?;
    }
    Ok(if errors.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::COMPILE_FAILED
    })
}

#[derive(Serialize)]
struct Invocation<'a, T: Serialize> {
    method: &'a str,
    #[serde(flatten)]
    body: T,
}

fn cmd_run(cfg: EngineConfig, args: &ProgramArgs, options: &str, setup: bool) -> Result<i32> {
    let mut engine = build_engine(cfg, args)?;
    if !engine.load() {
        eprintln!("{}", engine.program().snapshot().script_errors);
        return Ok(exit_codes::NOT_EXECUTED);
    }

    if setup {
        match engine.setup() {
            Ok(Some(result)) => {
                let activated = result.return_value;
                print_json(&Invocation {
                    method: "setup",
                    body: result,
                })?;
                if !activated {
                    return Ok(exit_codes::OK);
                }
            }
            Ok(None) => return Ok(exit_codes::NOT_EXECUTED),
            Err(fault) => return report_fault(engine.formatted_error(&fault, true)),
        }
    }

    match engine.run(options) {
        Ok(Some(result)) => {
            print_json(&Invocation {
                method: "run",
                body: result,
            })?;
            Ok(exit_codes::OK)
        }
        Ok(None) => Ok(exit_codes::NOT_EXECUTED),
        Err(fault) => report_fault(engine.formatted_error(&fault, false)),
    }
}

fn report_fault(error: ProgramError) -> Result<i32> {
    print_json(&error)?;
    Ok(exit_codes::RUNTIME_FAULT)
}

fn cmd_config(path: &Path, cfg: &EngineConfig, write: bool) -> Result<i32> {
    if write {
        write_config(path, cfg)?;
    } else {
        print!("{}", toml::to_string_pretty(cfg).context("serialize config toml")?);
    }
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("serialize json")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compile() {
        let cli = Cli::parse_from([
            "progengine",
            "compile",
            "--address",
            "7",
            "--main",
            "main.script",
        ]);
        assert_eq!(cli.config, PathBuf::from("progengine.toml"));
        match cli.command {
            Command::Compile { program } => {
                assert_eq!(program.address, "7");
                assert!(program.trigger.is_none());
            }
            _ => panic!("expected compile"),
        }
    }

    #[test]
    fn parse_run_with_setup() {
        let cli = Cli::parse_from([
            "progengine",
            "run",
            "--address",
            "7",
            "--main",
            "main.script",
            "--trigger",
            "cond.script",
            "--setup",
            "--options",
            "fast",
            "--config",
            "etc/engine.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("etc/engine.toml"));
        assert!(matches!(
            cli.command,
            Command::Run { setup: true, ref options, .. } if options == "fast"
        ));
    }

    #[test]
    fn cfg_root_resolves_relative_dirs() {
        let cfg = cfg_root(EngineConfig::default(), Path::new("etc/engine.toml"));
        assert_eq!(cfg.programs_dir, PathBuf::from("etc/programs"));
        let cfg = cfg_root(EngineConfig::default(), Path::new("engine.toml"));
        assert_eq!(cfg.programs_dir, PathBuf::from("programs"));
    }
}
