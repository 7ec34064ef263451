// store.rs — Trusted client state
//
// Everything the client trusts lives in one document, replaced atomically at
// the end of a successful cycle. A failed cycle never touches it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::tuf::model::{InstalledImage, MetaFile, Root, Signed, Snapshot, Targets, Timestamp};
use crate::tuf::verify;

pub const TRUSTED_FILE: &str = "trusted.json";

/// A verified metadata file together with the description of the exact
/// bytes it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustedFile<T> {
    pub meta: MetaFile,
    pub metadata: Signed<T>,
}

/// Last verified chain of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoTrust {
    pub root: Signed<Root>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Signed<Timestamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TrustedFile<Snapshot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TrustedFile<Targets>>,
}

impl RepoTrust {
    /// Trust a root obtained out of band.
    pub fn pinned(root: Signed<Root>) -> Result<Self> {
        verify::verify_pinned_root(&root)?;
        Ok(RepoTrust {
            root,
            timestamp: None,
            snapshot: None,
            targets: None,
        })
    }

    pub fn root_version(&self) -> u64 {
        self.root.signed.version
    }

    pub fn timestamp_version(&self) -> Option<u64> {
        self.timestamp.as_ref().map(|t| t.signed.version)
    }

    pub fn snapshot_version(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.meta.version)
    }

    pub fn targets_version(&self) -> Option<u64> {
        self.targets.as_ref().map(|t| t.meta.version)
    }

    pub fn target_entries(&self) -> Option<&Targets> {
        self.targets.as_ref().map(|t| &t.metadata.signed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustedState {
    pub director: RepoTrust,
    pub image: RepoTrust,
    /// ECU serial → image last installed on it by this client.
    #[serde(default)]
    pub installed: BTreeMap<String, InstalledImage>,
}

/// `trusted.json` in the client directory.
#[derive(Debug, Clone)]
pub struct TrustedStore {
    path: PathBuf,
}

impl TrustedStore {
    pub fn new(client_dir: &Path) -> Self {
        TrustedStore {
            path: client_dir.join(TRUSTED_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<TrustedState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotInitialized(format!(
                    "trusted state at {}",
                    self.path.display()
                )))
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| Error::json(TRUSTED_FILE, e))
    }

    /// Replace the trusted state in one rename.
    pub fn save(&self, state: &TrustedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| Error::json(TRUSTED_FILE, e))?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        let mut file = NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
        file.write_all(&bytes).map_err(|e| Error::io(file.path(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| Error::io(file.path(), e))?;
        file.persist(&self.path)
            .map_err(|e| Error::io(&self.path, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::repo::{RepoKind, Repository};
    use crate::sign::KeyStore;

    fn pinned_root(dir: &Path) -> Signed<Root> {
        Repository::init(dir, RepoKind::Image, KeyStore::generate(1), EngineConfig::default())
            .unwrap();
        let bytes = fs::read(dir.join("1.root.json")).unwrap();
        Signed::<Root>::from_slice("1.root.json", &bytes).unwrap()
    }

    #[test]
    fn load_before_bootstrap_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrustedStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
    }

    #[test]
    fn save_then_load() {
        let repos = tempfile::tempdir().unwrap();
        let client = tempfile::tempdir().unwrap();
        let root = pinned_root(repos.path());
        let state = TrustedState {
            director: RepoTrust::pinned(root.clone()).unwrap(),
            image: RepoTrust::pinned(root).unwrap(),
            installed: BTreeMap::new(),
        };
        let store = TrustedStore::new(client.path());
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn pinned_root_must_be_self_signed() {
        let repos = tempfile::tempdir().unwrap();
        let mut root = pinned_root(repos.path());
        root.signatures.clear();
        assert!(RepoTrust::pinned(root).is_err());
    }
}
