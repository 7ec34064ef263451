// store.rs — On-disk layout of one repository
//
//   <dir>/<version>.root.json        never overwritten
//   <dir>/<version>.targets.json     never overwritten
//   <dir>/<version>.snapshot.json    never overwritten
//   <dir>/timestamp.json             replaced by rename
//   <dir>/targets/<path>             artifact content
//
// Writes are staged as temp files next to their destination and only renamed
// into place by `Batch::commit`, in staging order.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tuf::model::{Role, RoleType, Signed};

pub const TARGETS_DIR: &str = "targets";

/// Resolve a logical target path below `base`, refusing anything that could
/// escape it.
pub fn resolve_target_path(base: &Path, target: &str) -> Result<PathBuf> {
    let invalid = || Error::InvalidTargetPath(target.to_string());
    if target.is_empty() || target.contains('\\') || target.ends_with('/') {
        return Err(invalid());
    }
    let mut path = base.to_path_buf();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => path.push(part),
            _ => return Err(invalid()),
        }
    }
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MetadataStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, target: &str) -> Result<PathBuf> {
        resolve_target_path(&self.dir.join(TARGETS_DIR), target)
    }

    /// Highest `<n>.root.json` present, if any.
    pub fn latest_root_version(&self) -> Result<Option<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };
        let mut latest = None;
        for entry in entries {
            let name = entry.map_err(|e| Error::io(&self.dir, e))?.file_name();
            let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".root.json"))
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            latest = latest.max(Some(version));
        }
        Ok(latest)
    }

    /// Read and parse a role file, `None` if it does not exist.
    pub fn read_role<T: Role>(&self, name: &str) -> Result<Option<Signed<T>>> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Signed::<T>::from_slice(name, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Read a role file that another trusted file references.
    pub fn require_role<T: Role>(&self, version: u64) -> Result<Signed<T>> {
        let name = T::TYPE.versioned_file(version);
        self.read_role(&name)?.ok_or_else(|| {
            Error::io(
                self.dir.join(&name),
                std::io::Error::new(ErrorKind::NotFound, "referenced metadata file is missing"),
            )
        })
    }

    pub fn read_artifact(&self, target: &str) -> Result<Vec<u8>> {
        let path = self.artifact_path(target)?;
        fs::read(&path).map_err(|e| Error::io(path, e))
    }

    pub fn batch(&self) -> Batch<'_> {
        Batch {
            store: self,
            staged: Vec::new(),
        }
    }
}

enum Placement {
    /// Fails if the destination already exists.
    New,
    /// Atomically replaces the destination.
    Replace,
}

struct Staged {
    path: PathBuf,
    temp: TempPath,
    placement: Placement,
}

/// A set of files written to temp paths, renamed into place on commit.
/// Dropping an uncommitted batch removes the temp files.
pub struct Batch<'a> {
    store: &'a MetadataStore,
    staged: Vec<Staged>,
}

impl Batch<'_> {
    pub fn stage_artifact(&mut self, target: &str, content: &[u8]) -> Result<()> {
        let path = self.store.artifact_path(target)?;
        self.stage(path, content, Placement::Replace)
    }

    pub fn stage_versioned(&mut self, role: RoleType, version: u64, bytes: &[u8]) -> Result<()> {
        let path = self.store.dir.join(role.versioned_file(version));
        if path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(ErrorKind::AlreadyExists, "metadata versions are immutable"),
            ));
        }
        self.stage(path, bytes, Placement::New)
    }

    pub fn stage_latest(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.store.dir.join(name);
        self.stage(path, bytes, Placement::Replace)
    }

    fn stage(&mut self, path: PathBuf, bytes: &[u8], placement: Placement) -> Result<()> {
        let mut file = create_temp_file(&path)?;
        file.write_all(bytes).map_err(|e| Error::io(file.path(), e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| Error::io(file.path(), e))?;
        self.staged.push(Staged {
            path,
            temp: file.into_temp_path(),
            placement,
        });
        Ok(())
    }

    /// Rename every staged file into place, in staging order.
    pub fn commit(self) -> Result<()> {
        for staged in self.staged {
            debug!(path = %staged.path.display(), "persisting");
            match staged.placement {
                Placement::New => staged
                    .temp
                    .persist_noclobber(&staged.path)
                    .map_err(|e| Error::io(&staged.path, e.error))?,
                Placement::Replace => staged
                    .temp
                    .persist(&staged.path)
                    .map_err(|e| Error::io(&staged.path, e.error))?,
            }
        }
        Ok(())
    }
}

// Temp files live next to their destination so the final rename never
// crosses a mount point.
fn create_temp_file(path: &Path) -> Result<NamedTempFile> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))
}
