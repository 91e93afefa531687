//! Compiled artifact storage under the programs directory.
//!
//! Layout:
//! - `<programs>/<address>.<ext>`: stable artifact, the only file `read` looks at.
//! - `<programs>/<address>.<ext>.<dbg>` and `<programs>/<address>.<dbg>`: paired
//!   debug symbols, for every configured debug extension.
//! - `<programs>/.staging/<address>/<random>.<ext>`: compiler output waiting
//!   for `commit`. Staging shares the filesystem with the stable path so the
//!   final `rename` is atomic.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, instrument, warn};

use crate::io::config::EngineConfig;

const STAGING_DIR: &str = ".staging";
const STAGED_NAME_LEN: usize = 16;

/// Artifact bytes read by copy; the backing file may be replaced afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactImage {
    pub bytes: Vec<u8>,
    pub debug: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    programs_dir: PathBuf,
    extension: String,
    debug_extensions: Vec<String>,
}

impl ArtifactStore {
    pub fn new(
        programs_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        debug_extensions: Vec<String>,
    ) -> Self {
        Self {
            programs_dir: programs_dir.into(),
            extension: extension.into(),
            debug_extensions,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            cfg.programs_dir.clone(),
            cfg.artifact_extension.clone(),
            cfg.debug_extensions.clone(),
        )
    }

    pub fn programs_dir(&self) -> &Path {
        &self.programs_dir
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let staging = self.programs_dir.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .with_context(|| format!("create directory {}", staging.display()))
    }

    pub fn stable_path(&self, address: &str) -> Result<PathBuf> {
        check_address(address)?;
        Ok(self
            .programs_dir
            .join(format!("{address}.{}", self.extension)))
    }

    fn staging_dir(&self, address: &str) -> Result<PathBuf> {
        check_address(address)?;
        Ok(self.programs_dir.join(STAGING_DIR).join(address))
    }

    /// Fresh staging path for one compile. Names are random and never reused.
    pub fn staging_path(&self, address: &str) -> Result<PathBuf> {
        let dir = self.staging_dir(address)?;
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        loop {
            let path = dir.join(format!("{}.{}", random_name(), self.extension));
            if !path.exists() {
                return Ok(path);
            }
        }
    }

    /// Every debug-symbol path that may pair with `artifact`.
    pub fn debug_variants(&self, artifact: &Path) -> Vec<PathBuf> {
        let mut variants = Vec::with_capacity(self.debug_extensions.len() * 2);
        for ext in &self.debug_extensions {
            let mut appended = artifact.as_os_str().to_owned();
            appended.push(format!(".{ext}"));
            variants.push(PathBuf::from(appended));
            variants.push(artifact.with_extension(ext));
        }
        variants
    }

    pub fn exists(&self, address: &str) -> bool {
        self.stable_path(address)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Replace the stable artifact of `address` with a staged one.
    ///
    /// Debug files move first and stale ones are set aside, so once the new
    /// artifact becomes visible its symbols are already in place. Until the
    /// artifact rename, a concurrent `read` may pair the old artifact with the
    /// new symbols. If any step fails, the previous debug files are put back
    /// and the stable artifact is untouched.
    #[instrument(skip(self), fields(staged = %staged.display()))]
    pub fn commit(&self, staged: &Path, address: &str) -> Result<()> {
        let stable = self.stable_path(address)?;
        if !staged.is_file() {
            return Err(anyhow!("missing staged artifact {}", staged.display()));
        }
        let mut aside = staged.as_os_str().to_owned();
        aside.push(".displaced");
        let aside = PathBuf::from(aside);
        fs::create_dir_all(&aside)
            .with_context(|| format!("create directory {}", aside.display()))?;

        let mut swaps = Vec::new();
        let result = self
            .swap_debug_files(staged, &stable, &aside, &mut swaps)
            .and_then(|()| {
                fs::rename(staged, &stable)
                    .with_context(|| format!("replace artifact {}", stable.display()))
            });
        if result.is_err() {
            restore_debug_files(&swaps);
        }
        if let Err(err) = fs::remove_dir_all(&aside) {
            warn!(err = %err, path = %aside.display(), "failed to remove displaced debug files");
        }
        result?;
        debug!(stable = %stable.display(), "artifact committed");
        Ok(())
    }

    /// Move staged debug files over the stable ones, recording each step in
    /// `swaps` so a failed commit can undo it.
    fn swap_debug_files(
        &self,
        staged: &Path,
        stable: &Path,
        aside: &Path,
        swaps: &mut Vec<DebugSwap>,
    ) -> Result<()> {
        let pairs = self
            .debug_variants(staged)
            .into_iter()
            .zip(self.debug_variants(stable));
        for (index, (from, to)) in pairs.enumerate() {
            let mut swap = DebugSwap {
                target: to,
                previous: None,
                installed: false,
            };
            if swap.target.is_file() {
                let kept = aside.join(index.to_string());
                fs::rename(&swap.target, &kept).with_context(|| {
                    format!("set aside debug file {}", swap.target.display())
                })?;
                swap.previous = Some(kept);
            }
            if !from.is_file() {
                swaps.push(swap);
                continue;
            }
            let moved = fs::rename(&from, &swap.target).with_context(|| {
                format!("move debug file {} to {}", from.display(), swap.target.display())
            });
            swap.installed = moved.is_ok();
            swaps.push(swap);
            moved?;
        }
        Ok(())
    }

    /// Delete the stable artifact and all paired debug files.
    pub fn evict(&self, address: &str) -> Result<()> {
        let stable = self.stable_path(address)?;
        remove_if_exists(&stable)?;
        for variant in self.debug_variants(&stable) {
            remove_if_exists(&variant)?;
        }
        Ok(())
    }

    /// Remove leftovers of interrupted compiles for `address`.
    pub fn clean_staging(&self, address: &str) -> Result<()> {
        let dir = self.staging_dir(address)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
        }
    }

    /// Drop one staged artifact and its debug files.
    pub fn discard(&self, staged: &Path) -> Result<()> {
        remove_if_exists(staged)?;
        for variant in self.debug_variants(staged) {
            remove_if_exists(&variant)?;
        }
        Ok(())
    }

    /// Read the stable artifact and, when present, its appended debug file.
    pub fn read(&self, address: &str) -> Result<ArtifactImage> {
        let stable = self.stable_path(address)?;
        let bytes =
            fs::read(&stable).with_context(|| format!("read artifact {}", stable.display()))?;
        let mut debug = None;
        for ext in &self.debug_extensions {
            let mut appended = stable.as_os_str().to_owned();
            appended.push(format!(".{ext}"));
            let path = PathBuf::from(appended);
            if path.is_file() {
                debug = Some(
                    fs::read(&path)
                        .with_context(|| format!("read debug file {}", path.display()))?,
                );
                break;
            }
        }
        Ok(ArtifactImage { bytes, debug })
    }
}

/// One stable debug path touched by `commit`.
#[derive(Debug)]
struct DebugSwap {
    target: PathBuf,
    previous: Option<PathBuf>,
    installed: bool,
}

fn restore_debug_files(swaps: &[DebugSwap]) {
    for swap in swaps.iter().rev() {
        if swap.installed {
            if let Err(err) = remove_if_exists(&swap.target) {
                warn!(err = %err, "failed to remove new debug file");
            }
        }
        if let Some(previous) = &swap.previous {
            if let Err(err) = fs::rename(previous, &swap.target) {
                warn!(err = %err, path = %swap.target.display(), "failed to restore debug file");
            }
        }
    }
}

/// Addresses become file names, so they are restricted to a safe alphabet.
pub fn check_address(address: &str) -> Result<()> {
    let valid = !address.is_empty()
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(anyhow!("invalid program address {address:?}"));
    }
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn random_name() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(STAGED_NAME_LEN)
        .collect()
}
