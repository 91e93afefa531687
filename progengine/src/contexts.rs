//! Generation-indexed registry of live execution contexts.
//!
//! Each program address owns a monotonically increasing generation counter.
//! Opening a context takes the next generation and marks it live; closing
//! retires it. Engines check liveness before every invocation, so a context
//! left over from an older generation can never be invoked.
//!
//! Registries created by [`Environment::init`](crate::io::environment::Environment::init)
//! also hold an on-disk claim per live address, so two environments sharing a
//! shadow root (in one process or several) never run the same program at once.
//! A claim names its owner's snapshot directory; a claim whose owner directory
//! is gone is left over from a dead process and may be taken over.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

/// Identifies one loaded incarnation of a program.
pub type Generation = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("program {address} already has live context generation {generation}")]
    AlreadyLive {
        address: String,
        generation: Generation,
    },
    #[error("program {address} is running in another environment ({owner})")]
    ClaimedElsewhere { address: String, owner: String },
    #[error("claim program {address}: {message}")]
    Claim { address: String, message: String },
}

#[derive(Debug, Default)]
struct Slot {
    last: Generation,
    live: Option<Generation>,
}

/// On-disk claims shared by every environment under one shadow root.
#[derive(Debug)]
struct Claims {
    dir: PathBuf,
    /// Directory holding one snapshot directory per owner.
    owners_root: PathBuf,
    owner: String,
}

impl Claims {
    fn acquire(&self, address: &str) -> Result<(), RegistryError> {
        let claim_err = |err: std::io::Error| RegistryError::Claim {
            address: address.to_string(),
            message: err.to_string(),
        };
        let path = self.dir.join(address);
        // Written aside and hard-linked in, so a visible claim always names its owner.
        let pending = self.dir.join(format!(".{}-{address}", self.owner));
        fs::write(&pending, &self.owner).map_err(claim_err)?;
        let result = loop {
            match fs::hard_link(&pending, &path) {
                Ok(()) => break Ok(()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path).unwrap_or_default();
                    let holder = holder.trim();
                    if holder != self.owner
                        && !holder.is_empty()
                        && self.owners_root.join(holder).is_dir()
                    {
                        break Err(RegistryError::ClaimedElsewhere {
                            address: address.to_string(),
                            owner: holder.to_string(),
                        });
                    }
                    warn!(address, holder, "taking over stale claim");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => break Err(claim_err(err)),
                    }
                }
                Err(err) => break Err(claim_err(err)),
            }
        };
        if let Err(err) = fs::remove_file(&pending) {
            warn!(err = %err, path = %pending.display(), "failed to remove pending claim");
        }
        result
    }

    fn release(&self, address: &str) {
        let path = self.dir.join(address);
        let held_by_us = fs::read_to_string(&path).is_ok_and(|holder| holder.trim() == self.owner);
        if !held_by_us {
            return;
        }
        if let Err(err) = fs::remove_file(&path) {
            warn!(err = %err, address, "failed to release claim");
        }
    }
}

#[derive(Debug, Default)]
pub struct ContextRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    claims: Option<Claims>,
}

impl ContextRegistry {
    /// Registry tracking contexts of this instance only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also claims addresses under `claims_dir` as `owner`,
    /// where `owner` names a directory in `owners_root`.
    pub fn with_claims(
        claims_dir: impl Into<PathBuf>,
        owners_root: impl Into<PathBuf>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            slots: Mutex::default(),
            claims: Some(Claims {
                dir: claims_dir.into(),
                owners_root: owners_root.into(),
                owner: owner.into(),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // The map stays consistent even if a holder panicked mid-update.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the next generation for `address`.
    pub fn open(&self, address: &str) -> Result<Generation, RegistryError> {
        let mut slots = self.slots();
        let slot = slots.entry(address.to_string()).or_default();
        if let Some(generation) = slot.live {
            return Err(RegistryError::AlreadyLive {
                address: address.to_string(),
                generation,
            });
        }
        if let Some(claims) = &self.claims {
            claims.acquire(address)?;
        }
        slot.last += 1;
        slot.live = Some(slot.last);
        debug!(address, generation = slot.last, "context opened");
        Ok(slot.last)
    }

    /// Retire `generation`. Closing anything but the live generation is a no-op.
    pub fn close(&self, address: &str, generation: Generation) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(address)
            && slot.live == Some(generation)
        {
            slot.live = None;
            if let Some(claims) = &self.claims {
                claims.release(address);
            }
            debug!(address, generation, "context closed");
        }
    }

    pub fn is_live(&self, address: &str, generation: Generation) -> bool {
        self.slots()
            .get(address)
            .is_some_and(|slot| slot.live == Some(generation))
    }

    pub fn live_generation(&self, address: &str) -> Option<Generation> {
        self.slots().get(address).and_then(|slot| slot.live)
    }
}
