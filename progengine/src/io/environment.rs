//! Process-wide environment, initialized once at startup.
//!
//! The startup sequence calls [`Environment::init`] before constructing any
//! engine and passes the result down. Initialization prepares the programs
//! directory, creates this environment's own snapshot directory under the
//! shadow root, parses the wrapper template and creates the context registry.
//!
//! Shadow root layout:
//! - `<shadow>/<pid>-<random>/`: snapshots of one environment, removed when it
//!   is dropped. Directories of processes that no longer exist are removed by
//!   the next `init`.
//! - `<shadow>/.claims/<address>`: which environment runs a program right now.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::contexts::ContextRegistry;
use crate::core::composer::WrapperTemplate;
use crate::io::artifact_store::ArtifactStore;
use crate::io::config::EngineConfig;

#[derive(Debug)]
pub struct Environment {
    config: EngineConfig,
    store: ArtifactStore,
    template: WrapperTemplate,
    registry: ContextRegistry,
    shadow: TempDir,
}

impl Environment {
    #[instrument(skip_all, fields(programs_dir = %config.programs_dir.display()))]
    pub fn init(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let store = ArtifactStore::from_config(&config);
        store.ensure_dirs()?;

        let shadow_root = &config.shadow_dir;
        let claims_dir = shadow_root.join(CLAIMS_DIR);
        fs::create_dir_all(&claims_dir)
            .with_context(|| format!("create shadow dir {}", claims_dir.display()))?;
        remove_dead_snapshots(shadow_root);
        let shadow = tempfile::Builder::new()
            .prefix(&format!("{}-", std::process::id()))
            .tempdir_in(shadow_root)
            .with_context(|| format!("create snapshot dir in {}", shadow_root.display()))?;
        let owner = shadow
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let registry = ContextRegistry::with_claims(claims_dir, shadow_root, owner);

        let template = match &config.template_path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read template {}", path.display()))?;
                WrapperTemplate::parse(&text)
                    .with_context(|| format!("parse template {}", path.display()))?
            }
            None => WrapperTemplate::default(),
        };

        info!(
            shadow = %shadow.path().display(),
            main_offset = template.main_offset(),
            trigger_offset = template.trigger_offset(),
            "environment initialized"
        );
        Ok(Arc::new(Self {
            config,
            store,
            template,
            registry,
            shadow,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn template(&self) -> &WrapperTemplate {
        &self.template
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Snapshot directory owned by this environment; loaders copy artifacts here.
    pub fn shadow_dir(&self) -> &Path {
        self.shadow.path()
    }
}

const CLAIMS_DIR: &str = ".claims";

/// Remove snapshot directories whose owning process has exited.
fn remove_dead_snapshots(shadow_root: &Path) {
    let entries = match fs::read_dir(shadow_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(err = %err, "cannot list shadow dir");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name
            .to_str()
            .and_then(|name| name.split_once('-'))
            .and_then(|(pid, _)| pid.parse::<u32>().ok())
        else {
            continue;
        };
        if process_alive(pid) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale snapshots"),
            Err(err) => warn!(err = %err, path = %path.display(), "failed to remove stale snapshots"),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id() || Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a process table to consult, every owner counts as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            programs_dir: root.join("programs"),
            shadow_dir: root.join("shadow"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn init_creates_own_snapshot_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path());

        let env = Environment::init(cfg.clone()).expect("init");
        let shadow = env.shadow_dir().to_path_buf();
        assert!(shadow.is_dir());
        assert_eq!(shadow.parent(), Some(cfg.shadow_dir.as_path()));
        let name = shadow.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with(&format!("{}-", std::process::id())));
        assert!(cfg.programs_dir.is_dir());
        assert_eq!(env.store().programs_dir(), cfg.programs_dir.as_path());

        drop(env);
        assert!(!shadow.exists());
    }

    #[test]
    fn second_init_leaves_first_snapshots_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path());

        let first = Environment::init(cfg.clone()).expect("first init");
        let snapshot = first.shadow_dir().join("7").join("1.unit");
        fs::create_dir_all(snapshot.parent().expect("parent")).expect("snapshot dir");
        fs::write(&snapshot, b"live").expect("snapshot");
        let symbols = first.shadow_dir().join("7").join("1.unit.pdb");
        fs::write(&symbols, b"symbols").expect("symbols");
        let generation = first.registry().open("7").expect("first open");

        let second = Environment::init(cfg).expect("second init");
        assert_ne!(first.shadow_dir(), second.shadow_dir());
        assert_eq!(fs::read(&snapshot).expect("snapshot survives"), b"live");
        assert!(symbols.is_file());

        let err = second.registry().open("7").unwrap_err();
        assert!(err.to_string().contains("another environment"), "{err}");

        first.registry().close("7", generation);
        assert_eq!(second.registry().open("7").expect("second open"), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn init_removes_snapshots_of_exited_processes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config(temp.path());
        let dead = cfg.shadow_dir.join("999999999-gone");
        fs::create_dir_all(dead.join("7")).expect("dead dir");
        fs::write(dead.join("7").join("1.unit"), b"stale").expect("stale file");
        let live = cfg.shadow_dir.join(format!("{}-other", std::process::id()));
        fs::create_dir_all(&live).expect("live dir");
        let unrelated = cfg.shadow_dir.join("notes");
        fs::create_dir_all(&unrelated).expect("unrelated dir");

        let _env = Environment::init(cfg).expect("init");
        assert!(!dead.exists());
        assert!(live.is_dir());
        assert!(unrelated.is_dir());
    }

    #[test]
    fn init_reads_template_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template_path = temp.path().join("wrapper.tpl");
        fs::write(&template_path, "a\nb\n{{program}}\nc\n{{condition}}\n").expect("template");
        let cfg = EngineConfig {
            template_path: Some(template_path),
            ..config(temp.path())
        };

        let env = Environment::init(cfg).expect("init");
        assert_eq!(env.template().main_offset(), 2);
        assert_eq!(env.template().trigger_offset(), 1);
    }

    #[test]
    fn init_rejects_template_without_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template_path = temp.path().join("wrapper.tpl");
        fs::write(&template_path, "no markers\n").expect("template");
        let cfg = EngineConfig {
            template_path: Some(template_path),
            ..config(temp.path())
        };

        let err = Environment::init(cfg).unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }
}
