//! Loading compiled units into an isolation boundary and binding their entry.
//!
//! Every unit exposes the same capability set ([`ScriptEntry`]). A
//! [`UnitLoader`] turns an artifact image into a bound entry or a structured
//! [`BindingError`]. [`ProcessLoader`] isolates each unit in its own child
//! process, launched from a private snapshot of the image bytes so the stable
//! artifact can be replaced while the unit keeps running.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{MethodRunResult, ScriptFault, StackFrame};
use crate::io::artifact_store::ArtifactImage;

/// Capability contract of a loaded program unit.
pub trait ScriptEntry: Send {
    fn set_host(&mut self, host: &str, address: &str) -> Result<(), ScriptFault>;
    fn setup(&mut self) -> Result<MethodRunResult, ScriptFault>;
    fn run(&mut self, options: &str) -> Result<MethodRunResult, ScriptFault>;
    fn reset(&mut self) -> Result<(), ScriptFault>;

    /// Whether `reset` does anything; units may leave it out.
    fn supports_reset(&self) -> bool {
        true
    }

    /// False once the unit can no longer answer calls reliably. The engine
    /// drops such an entry and binds a fresh one on the next call.
    fn is_usable(&self) -> bool {
        true
    }
}

/// Everything a loader needs to bind one generation of a unit.
#[derive(Debug, Clone, Copy)]
pub struct BindRequest<'a> {
    pub address: &'a str,
    pub generation: u64,
    pub image: &'a ArtifactImage,
    pub entry_type: &'a str,
    pub host: &'a str,
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("start program unit: {0}")]
    Spawn(String),
    #[error("entry type {found:?} does not match {expected:?}")]
    EntryTypeMismatch { expected: String, found: String },
    #[error("entry type does not expose `{0}`")]
    MissingCapability(String),
    #[error("program unit protocol error: {0}")]
    Protocol(String),
    #[error("set_host failed: {0}")]
    HostRejected(ScriptFault),
}

/// Abstraction over isolation backends.
pub trait UnitLoader {
    /// Load the image and resolve its entry. `set_host` is not called here.
    fn bind(&self, request: &BindRequest<'_>) -> Result<Box<dyn ScriptEntry>, BindingError>;
}

/// Bind through `loader` and hand the unit its host.
pub fn bind_entry<L: UnitLoader + ?Sized>(
    loader: &L,
    request: &BindRequest<'_>,
) -> Result<Box<dyn ScriptEntry>, BindingError> {
    let mut entry = loader.bind(request)?;
    entry
        .set_host(request.host, request.address)
        .map_err(BindingError::HostRejected)?;
    Ok(entry)
}

const REQUIRED_CAPABILITIES: [&str; 3] = ["set_host", "setup", "run"];

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Bind,
    SetHost { host: &'a str, address: &'a str },
    Setup,
    Run { options: &'a str },
    Reset,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Bound {
        entry: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Ok {
        return_value: bool,
        #[serde(default)]
        state: serde_json::Value,
    },
    Done,
    Fault {
        message: String,
        #[serde(default)]
        frames: Vec<StackFrame>,
    },
}

/// Loader that runs each unit as a child process speaking JSON lines.
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    shadow_dir: PathBuf,
    extension: String,
}

impl ProcessLoader {
    pub fn new(shadow_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            shadow_dir: shadow_dir.into(),
            extension: extension.into(),
        }
    }

    fn write_snapshot(&self, request: &BindRequest<'_>) -> std::io::Result<PathBuf> {
        let dir = self.shadow_dir.join(request.address);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.{}", request.generation, self.extension));
        fs::write(&path, &request.image.bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        if let Some(symbols) = &request.image.debug {
            fs::write(symbols_path(&path), symbols)?;
        }
        Ok(path)
    }
}

impl UnitLoader for ProcessLoader {
    #[instrument(skip_all, fields(address = request.address, generation = request.generation))]
    fn bind(&self, request: &BindRequest<'_>) -> Result<Box<dyn ScriptEntry>, BindingError> {
        let snapshot = self
            .write_snapshot(request)
            .map_err(|err| BindingError::Spawn(format!("write snapshot: {err}")))?;

        let mut cmd = Command::new(&snapshot);
        cmd.env("PROGENGINE_ADDRESS", request.address)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if request.image.debug.is_some() {
            cmd.env("PROGENGINE_SYMBOLS", symbols_path(&snapshot));
        }
        let mut child = match spawn_snapshot(&mut cmd) {
            Ok(child) => child,
            Err(err) => {
                remove_snapshot(&snapshot);
                return Err(BindingError::Spawn(err.to_string()));
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            remove_snapshot(&snapshot);
            return Err(BindingError::Spawn("child pipes were not created".to_string()));
        };

        let mut entry = ProcessEntry {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            snapshot,
            supports_reset: false,
            broken: false,
        };
        match entry.call(&Request::Bind) {
            Ok(Response::Bound {
                entry: found,
                capabilities,
            }) => {
                if !found.ends_with(request.entry_type) {
                    return Err(BindingError::EntryTypeMismatch {
                        expected: request.entry_type.to_string(),
                        found,
                    });
                }
                if let Some(missing) = REQUIRED_CAPABILITIES
                    .iter()
                    .find(|cap| !capabilities.iter().any(|c| c == *cap))
                {
                    return Err(BindingError::MissingCapability(missing.to_string()));
                }
                entry.supports_reset = capabilities.iter().any(|c| c == "reset");
                debug!(entry = %found, "program unit bound");
                Ok(Box::new(entry))
            }
            Ok(other) => Err(BindingError::Protocol(format!(
                "expected bound, got {other:?}"
            ))),
            Err(err) => Err(BindingError::Protocol(err)),
        }
    }
}

/// One running unit process.
struct ProcessEntry {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    snapshot: PathBuf,
    supports_reset: bool,
    /// Set after any transport or protocol failure; responses may be out of step.
    broken: bool,
}

impl ProcessEntry {
    fn call(&mut self, request: &Request<'_>) -> Result<Response, String> {
        if self.broken {
            return Err("program unit is out of sync with the engine".to_string());
        }
        let result = self.exchange(request);
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Send one request and read up to its response. Lines that are not
    /// protocol responses are program output and are skipped.
    fn exchange(&mut self, request: &Request<'_>) -> Result<Response, String> {
        let mut line = serde_json::to_string(request).map_err(|err| err.to_string())?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|()| self.stdin.flush())
            .map_err(|err| format!("write request: {err}"))?;

        loop {
            let mut reply = String::new();
            let n = self
                .stdout
                .read_line(&mut reply)
                .map_err(|err| format!("read response: {err}"))?;
            if n == 0 {
                return Err("program unit exited".to_string());
            }
            let reply = reply.trim();
            match parse_response(reply) {
                Some(parsed) => {
                    return parsed.map_err(|err| format!("parse response: {err}"));
                }
                None => debug!(line = reply, "program output"),
            }
        }
    }

    fn invoke(&mut self, request: &Request<'_>) -> Result<MethodRunResult, ScriptFault> {
        match self.call(request).map_err(ScriptFault::new)? {
            Response::Ok {
                return_value,
                state,
            } => Ok(MethodRunResult {
                return_value,
                state,
            }),
            Response::Fault { message, frames } => Err(ScriptFault { message, frames }),
            other => Err(ScriptFault::new(format!("unexpected response {other:?}"))),
        }
    }

    fn command(&mut self, request: &Request<'_>) -> Result<(), ScriptFault> {
        match self.call(request).map_err(ScriptFault::new)? {
            Response::Done => Ok(()),
            Response::Fault { message, frames } => Err(ScriptFault { message, frames }),
            other => Err(ScriptFault::new(format!("unexpected response {other:?}"))),
        }
    }
}

impl ScriptEntry for ProcessEntry {
    fn set_host(&mut self, host: &str, address: &str) -> Result<(), ScriptFault> {
        self.command(&Request::SetHost { host, address })
    }

    fn setup(&mut self) -> Result<MethodRunResult, ScriptFault> {
        self.invoke(&Request::Setup)
    }

    fn run(&mut self, options: &str) -> Result<MethodRunResult, ScriptFault> {
        self.invoke(&Request::Run { options })
    }

    fn reset(&mut self) -> Result<(), ScriptFault> {
        self.command(&Request::Reset)
    }

    fn supports_reset(&self) -> bool {
        self.supports_reset
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }
}

/// `None` for lines without a `status` tag; those are not responses.
fn parse_response(line: &str) -> Option<serde_json::Result<Response>> {
    if !line.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("status")?;
    Some(serde_json::from_value(value))
}

impl Drop for ProcessEntry {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "program unit already exited");
        }
        if let Err(err) = self.child.wait() {
            warn!(err = %err, "failed to reap program unit");
        }
        remove_snapshot(&self.snapshot);
    }
}

fn symbols_path(snapshot: &Path) -> PathBuf {
    let mut path = snapshot.as_os_str().to_owned();
    path.push(".sym");
    PathBuf::from(path)
}

fn remove_snapshot(snapshot: &Path) {
    for path in [snapshot.to_path_buf(), symbols_path(snapshot)] {
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(err = %err, path = %path.display(), "failed to remove snapshot");
        }
    }
}

// ETXTBSY: another thread may have forked while the snapshot was still open for writing.
const TEXT_FILE_BUSY: i32 = 26;

fn spawn_snapshot(cmd: &mut Command) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(err) if err.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            other => return other,
        }
    }
}
