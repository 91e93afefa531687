//! Compiler abstraction for program units.
//!
//! The [`Compiler`] trait decouples the engine from the actual compilation
//! backend. [`CommandCompiler`] drives an external compiler process; tests use
//! scripted compilers that write predetermined artifacts and diagnostics.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ProgramError, RawDiagnostic};
use crate::io::artifact_store::remove_if_exists;
use crate::io::config::CompilerConfig;
use crate::io::process::run_tool;

/// Parameters for one compilation.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub address: String,
    /// Composed unit text (both fragments already inside the wrapper).
    pub source: String,
    /// Trigger condition as authored, for compilers that want it separately.
    pub trigger_source: Option<String>,
    /// Staging path the artifact must be written to.
    pub output_path: PathBuf,
    pub references: Vec<String>,
}

/// Compiler response. The artifact itself lives at `CompileRequest::output_path`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutput {
    /// Diagnostics positioned in the composed unit.
    pub diagnostics: Vec<RawDiagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| !d.warning)
    }
}

/// Abstraction over compilation backends.
///
/// `Err` means the tool itself failed; source problems are diagnostics.
pub trait Compiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput>;
}

/// Compiler that runs an external command.
///
/// Invocation: `command... <source> --out <output> [--reference <lib>]...`.
/// Every stdout line holding a JSON object is read as one diagnostic.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandCompiler {
    pub fn new(cfg: &CompilerConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl Compiler for CommandCompiler {
    #[instrument(skip_all, fields(address = %request.address, timeout_secs = self.timeout.as_secs()))]
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("compiler command is empty"))?;

        let mut source_path = request.output_path.as_os_str().to_owned();
        source_path.push(".src");
        let source_path = PathBuf::from(source_path);
        fs::write(&source_path, &request.source)
            .with_context(|| format!("write unit source {}", source_path.display()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&source_path)
            .arg("--out")
            .arg(&request.output_path);
        for reference in &request.references {
            cmd.arg("--reference").arg(reference);
        }

        info!(program = %program, "starting compiler");
        let result = run_tool(cmd, self.timeout, self.output_limit_bytes);
        remove_if_exists(&source_path)?;
        let output = result.context("run compiler")?;

        if output.timed_out {
            return Err(anyhow!("compiler timed out after {:?}", self.timeout));
        }

        let compiled = CompileOutput {
            diagnostics: parse_diagnostics(&output.stdout_text()),
        };
        if !output.status.success() && !compiled.has_errors() {
            warn!(exit_code = ?output.status.code(), "compiler failed without diagnostics");
            return Err(anyhow!(
                "compiler failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        if !compiled.has_errors() && !request.output_path.is_file() {
            return Err(anyhow!(
                "compiler produced no artifact at {}",
                request.output_path.display()
            ));
        }

        debug!(
            diagnostics = compiled.diagnostics.len(),
            "compiler finished"
        );
        Ok(compiled)
    }
}

/// Parse one diagnostic per JSON-object line; other lines are compiler chatter.
///
/// An object that carries a `message` but does not fit the diagnostic shape
/// still counts as an error at an unknown position, so a compile that
/// reported a problem is never committed.
pub fn parse_diagnostics(stdout: &str) -> Vec<RawDiagnostic> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(parse_diagnostic_line)
        .collect()
}

fn parse_diagnostic_line(line: &str) -> Option<RawDiagnostic> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(err = %err, line, "skipping compiler chatter");
            return None;
        }
    };
    let message = value.get("message").and_then(|m| m.as_str()).map(str::to_string);
    match serde_json::from_value::<RawDiagnostic>(value) {
        Ok(diagnostic) => Some(diagnostic),
        Err(err) => {
            let message = message?;
            warn!(err = %err, line, "malformed compiler diagnostic");
            Some(RawDiagnostic {
                line: 0,
                column: 0,
                message,
                code: ProgramError::SYNTHETIC_CODE.to_string(),
                warning: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_diagnostics_skips_chatter() {
        let stdout = "scriptc 1.0\n\
            {\"line\":12,\"column\":5,\"message\":\"unknown name\",\"code\":\"E100\"}\n\
            {\"line\":3,\"message\":\"unused\",\"warning\":true}\n\
            {not json}\n";
        let diagnostics = parse_diagnostics(stdout);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].line, 12);
        assert_eq!(diagnostics[0].code, "E100");
        assert!(!diagnostics[0].warning);
        assert!(diagnostics[1].warning);
        assert_eq!(diagnostics[1].column, 0);
    }

    #[test]
    fn diagnostic_without_position_defaults_to_line_zero() {
        let diagnostics = parse_diagnostics("{\"message\":\"fatal\",\"code\":\"E9\"}\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 0);
        assert_eq!(diagnostics[0].code, "E9");
        assert!(!diagnostics[0].warning);
    }

    #[test]
    fn malformed_diagnostic_with_message_is_an_error() {
        let stdout = "{\"message\":\"bad shape\",\"line\":\"twelve\"}\n{\"progress\":50}\n";
        let diagnostics = parse_diagnostics(stdout);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "bad shape");
        assert_eq!(diagnostics[0].code, "-1");
        assert_eq!(diagnostics[0].line, 0);
        assert!(!diagnostics[0].warning);
    }

    #[cfg(unix)]
    #[test]
    fn error_without_line_blocks_successful_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler =
            sh_compiler("cp \"$1\" \"$3\"; echo '{\"message\":\"fatal\",\"code\":\"E9\"}'; exit 0");
        let output = compiler.compile(&request(temp.path())).expect("compile");
        assert!(output.has_errors());
        assert_eq!(output.diagnostics[0].message, "fatal");
    }

    fn request(dir: &std::path::Path) -> CompileRequest {
        CompileRequest {
            address: "7".to_string(),
            source: "unit text".to_string(),
            trigger_source: None,
            output_path: dir.join("out.unit"),
            references: vec!["host.net".to_string()],
        }
    }

    fn sh_compiler(script: &str) -> CommandCompiler {
        CommandCompiler {
            command: ["sh", "-c", script, "scriptc"]
                .map(str::to_string)
                .to_vec(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    // `sh -c script scriptc <source> --out <output> --reference host.net`
    // puts the source at $1 and the output at $3.
    #[cfg(unix)]
    #[test]
    fn command_compiler_writes_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = sh_compiler("cp \"$1\" \"$3\"; test \"$5\" = host.net");
        let req = request(temp.path());
        let output = compiler.compile(&req).expect("compile");
        assert!(output.diagnostics.is_empty());
        assert_eq!(fs::read_to_string(&req.output_path).expect("artifact"), "unit text");
        assert!(!temp.path().join("out.unit.src").exists());
    }

    #[cfg(unix)]
    #[test]
    fn command_compiler_returns_error_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = sh_compiler(
            "echo '{\"line\":4,\"column\":2,\"message\":\"bad\",\"code\":\"E1\"}'; exit 1",
        );
        let output = compiler.compile(&request(temp.path())).expect("compile");
        assert!(output.has_errors());
        assert_eq!(output.diagnostics[0].message, "bad");
    }

    #[cfg(unix)]
    #[test]
    fn command_compiler_failure_without_diagnostics_is_tool_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = sh_compiler("echo crashed >&2; exit 70");
        let err = compiler.compile(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("crashed"));
    }

    #[cfg(unix)]
    #[test]
    fn command_compiler_requires_artifact_on_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let compiler = sh_compiler("exit 0");
        let err = compiler.compile(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("no artifact"));
    }
}
