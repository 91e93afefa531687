//! Engine configuration stored in `progengine.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Missing fields default to values that work for a `programs/` directory
/// next to the working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one stable artifact per program address.
    pub programs_dir: PathBuf,

    /// Per-process directory for snapshots of loaded artifacts.
    pub shadow_dir: PathBuf,

    /// Wrapper template file. The built-in template is used when unset.
    pub template_path: Option<PathBuf>,

    /// Fully-qualified name of the entry type every program unit exposes.
    pub entry_type: String,

    /// Extension of stable and staged artifacts (without the dot).
    pub artifact_extension: String,

    /// Debug-symbol extensions, each checked both appended and replacing.
    pub debug_extensions: Vec<String>,

    pub compiler: CompilerConfig,

    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler argv prefix (e.g. `["scriptc"]`).
    pub command: Vec<String>,

    /// Libraries referenced by every compile.
    pub references: Vec<String>,

    pub timeout_secs: u64,

    /// Stop collecting compiler stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    /// Handle handed to every program through `set_host`.
    pub endpoint: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: vec!["scriptc".to_string()],
            references: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: "local".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            programs_dir: PathBuf::from("programs"),
            shadow_dir: PathBuf::from("programs").join(".shadow"),
            template_path: None,
            entry_type: "automation.scripting.ScriptingInstance".to_string(),
            artifact_extension: "unit".to_string(),
            debug_extensions: vec!["mdb".to_string(), "pdb".to_string()],
            compiler: CompilerConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.entry_type.trim().is_empty() {
            return Err(anyhow!("entry_type must be non-empty"));
        }
        validate_extension("artifact_extension", &self.artifact_extension)?;
        if self.debug_extensions.is_empty() {
            return Err(anyhow!("debug_extensions must be a non-empty array"));
        }
        for ext in &self.debug_extensions {
            validate_extension("debug_extensions", ext)?;
        }
        if self.shadow_dir == self.programs_dir {
            return Err(anyhow!("shadow_dir must differ from programs_dir"));
        }
        if self.compiler.command.is_empty() || self.compiler.command[0].trim().is_empty() {
            return Err(anyhow!("compiler.command must be a non-empty array"));
        }
        if self.compiler.timeout_secs == 0 {
            return Err(anyhow!("compiler.timeout_secs must be > 0"));
        }
        if self.compiler.output_limit_bytes == 0 {
            return Err(anyhow!("compiler.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolve relative directories against `base` (usually the config file's directory).
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let root = |path: PathBuf| {
            if path.is_relative() {
                base.join(path)
            } else {
                path
            }
        };
        self.programs_dir = root(self.programs_dir);
        self.shadow_dir = root(self.shadow_dir);
        self.template_path = self.template_path.map(root);
        self
    }
}

fn validate_extension(field: &str, ext: &str) -> Result<()> {
    if ext.is_empty() || ext.contains('.') || ext.contains('/') {
        return Err(anyhow!("{field} entries must be bare extensions, got {ext:?}"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
