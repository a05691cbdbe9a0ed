//! Backend selection from `store:` config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::{StorageBackend, StoreConfig};

use super::{MemoryVerdictStore, PersistentVerdictStore, SharedVerdictStore};

const APP_DIR: &str = "bounced";

/// Open the configured verdict store.
pub fn create_store(config: &StoreConfig) -> anyhow::Result<SharedVerdictStore> {
    match config.backend {
        StorageBackend::Memory => {
            info!(backend = "memory", "verdicts are lost on restart");
            Ok(Arc::new(MemoryVerdictStore::new()))
        }
        StorageBackend::Fjall => {
            let dir = match &config.fjall.path {
                Some(path) => absolute(path)?,
                None => default_dir(),
            };
            let store: SharedVerdictStore = PersistentVerdictStore::open(&dir)
                .with_context(|| format!("can't open verdicts at {}", dir.display()))?;
            Ok(store)
        }
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("can't resolve relative store path")?;
    Ok(cwd.join(path))
}

/// System-wide for root, per-user otherwise.
fn default_dir() -> PathBuf {
    if is_root() {
        return Path::new("/var/lib").join(APP_DIR);
    }
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|base| base.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and can't fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
