// mod.rs — Client verifier: one update cycle over the Director and Image
// repositories
//
// The Director chain is refreshed first. Only when the Director publishes new
// Targets is the Image chain refreshed and each directed artifact
// cross-validated against it, downloaded and verified. Trust-chain failures
// abort the cycle without touching trusted state; artifact failures are
// reported and the rest of the cycle proceeds.

mod chain;
pub mod remote;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hash;
use crate::repo::store::{resolve_target_path, TARGETS_DIR};
use crate::timeserver::TrustedClock;
use crate::tuf::model::{InstalledImage, Root, Signed, TargetFile, Targets};

pub use chain::{MAX_ROOT_LENGTH, MAX_TIMESTAMP_LENGTH};
pub use remote::{FsRemote, Remote};
pub use store::{RepoTrust, TrustedState, TrustedStore};

/// Last state an update cycle reached for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RootChecked,
    TimestampChecked,
    /// The Timestamp still pins the trusted Snapshot.
    SnapshotUnchanged,
    SnapshotChecked,
    /// The new Snapshot still pins the trusted Targets.
    TargetsUnchanged,
    TargetsChecked,
    CrossValidated,
    ArtifactsAuthorized,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::RootChecked => "root checked",
            Phase::TimestampChecked => "timestamp checked",
            Phase::SnapshotUnchanged => "snapshot unchanged",
            Phase::SnapshotChecked => "snapshot checked",
            Phase::TargetsUnchanged => "targets unchanged",
            Phase::TargetsChecked => "targets checked",
            Phase::CrossValidated => "cross-validated",
            Phase::ArtifactsAuthorized => "artifacts authorized",
        };
        f.write_str(name)
    }
}

/// A failed cycle: which repository, how far it got, and why.
#[derive(Debug, thiserror::Error)]
#[error("{repo} repository: update failed after {phase}: {source}")]
pub struct CycleError {
    pub repo: &'static str,
    pub phase: Phase,
    #[source]
    pub source: Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedArtifact {
    pub path: String,
    pub ecu_serial: String,
    pub length: u64,
    pub stored_at: PathBuf,
}

#[derive(Debug)]
pub struct RejectedArtifact {
    pub path: String,
    pub ecu_serial: String,
    pub error: Error,
}

#[derive(Debug)]
pub struct CycleReport {
    pub director_phase: Phase,
    pub image_phase: Phase,
    pub authorized: Vec<AuthorizedArtifact>,
    pub rejected: Vec<RejectedArtifact>,
    /// Director targets not bound to one of this device's ECUs.
    pub ignored: Vec<String>,
    /// Director targets already installed on their ECU.
    pub already_installed: Vec<String>,
}

impl CycleReport {
    fn new() -> Self {
        CycleReport {
            director_phase: Phase::Idle,
            image_phase: Phase::Idle,
            authorized: Vec::new(),
            rejected: Vec::new(),
            ignored: Vec::new(),
            already_installed: Vec::new(),
        }
    }

    pub fn downloads(&self) -> usize {
        self.authorized.len()
    }
}

/// An artifact that passed cross-validation and download verification, not
/// yet written out.
struct Verified {
    path: String,
    ecu_serial: String,
    content: Vec<u8>,
}

/// Client-side updater for one device (a primary and its ECUs).
pub struct Updater<D, I> {
    director: D,
    image: I,
    store: TrustedStore,
    targets_dir: PathBuf,
    ecu_serials: BTreeSet<String>,
}

/// Write the initial trusted state from roots obtained out of band.
pub fn bootstrap(client_dir: &Path, director_root: &[u8], image_root: &[u8]) -> Result<()> {
    let director = Signed::<Root>::from_slice("director root", director_root)?;
    let image = Signed::<Root>::from_slice("image root", image_root)?;
    let state = TrustedState {
        director: RepoTrust::pinned(director)?,
        image: RepoTrust::pinned(image)?,
        installed: BTreeMap::new(),
    };
    TrustedStore::new(client_dir).save(&state)?;
    info!(client = %client_dir.display(), "pinned director and image roots");
    Ok(())
}

impl<D: Remote, I: Remote> Updater<D, I> {
    pub fn new(
        client_dir: &Path,
        director: D,
        image: I,
        ecu_serials: impl IntoIterator<Item = String>,
    ) -> Self {
        Updater {
            director,
            image,
            store: TrustedStore::new(client_dir),
            targets_dir: client_dir.join(TARGETS_DIR),
            ecu_serials: ecu_serials.into_iter().collect(),
        }
    }

    pub fn trusted(&self) -> Result<TrustedState> {
        self.store.load()
    }

    pub fn update(&self) -> std::result::Result<CycleReport, CycleError> {
        self.update_at(Utc::now())
    }

    /// Run one cycle with expiry judged against the last time `clock` has
    /// verified, instead of the local clock. Fails before any fetch when the
    /// clock has accepted no attestation yet.
    pub fn update_attested(
        &self,
        clock: &TrustedClock,
    ) -> std::result::Result<CycleReport, CycleError> {
        let Some(now) = clock.now() else {
            return Err(CycleError {
                repo: "client",
                phase: Phase::Idle,
                source: Error::TimeAttestation("no attested time yet".into()),
            });
        };
        debug!(%now, "update cycle on attested time");
        self.update_at(now)
    }

    /// Run one cycle against the given notion of current time.
    pub fn update_at(&self, now: DateTime<Utc>) -> std::result::Result<CycleReport, CycleError> {
        let fail = |repo: &'static str, phase: Phase, source: Error| CycleError { repo, phase, source };
        let trusted = self.store.load().map_err(|e| fail("client", Phase::Idle, e))?;
        let mut report = CycleReport::new();

        let mut phase = Phase::Idle;
        let director = chain::refresh("director", &self.director, &trusted.director, now, &mut phase)
            .map_err(|e| fail("director", phase, e))?;
        report.director_phase = phase;

        if !director.targets_changed {
            // Nothing new to install: commit the fresher timestamp and stop.
            report.director_phase = Phase::ArtifactsAuthorized;
            let state = TrustedState {
                director: director.trust,
                ..trusted
            };
            self.store
                .save(&state)
                .map_err(|e| fail("client", report.director_phase, e))?;
            info!("no new director targets");
            return Ok(report);
        }

        let mut phase = Phase::Idle;
        let image = chain::refresh("image", &self.image, &trusted.image, now, &mut phase)
            .map_err(|e| fail("image", phase, e))?;
        report.image_phase = phase;

        let empty = BTreeMap::new();
        let directed = director
            .trust
            .target_entries()
            .map_or(&empty, |t| &t.targets);
        let catalog = image.trust.target_entries();

        let mut verified = Vec::new();
        for (path, target) in directed {
            let Some(ecu_serial) = target.ecu_serial() else {
                warn!(path, "director target has no ECU binding, ignoring");
                report.ignored.push(path.clone());
                continue;
            };
            if !self.ecu_serials.contains(ecu_serial) {
                debug!(path, ecu_serial, "director target is for another device");
                report.ignored.push(path.clone());
                continue;
            }
            if trusted
                .installed
                .get(ecu_serial)
                .is_some_and(|installed| installed.matches(path, target))
            {
                debug!(path, ecu_serial, "already installed");
                report.already_installed.push(path.clone());
                continue;
            }

            let outcome = cross_validate(path, target, catalog)
                .and_then(|()| self.download(path, target));
            match outcome {
                Ok(content) => verified.push(Verified {
                    path: path.clone(),
                    ecu_serial: ecu_serial.to_string(),
                    content,
                }),
                Err(error) if error.is_artifact_scoped() => {
                    warn!(path, ecu_serial, %error, "artifact rejected");
                    report.rejected.push(RejectedArtifact {
                        path: path.clone(),
                        ecu_serial: ecu_serial.to_string(),
                        error,
                    });
                }
                Err(error) => return Err(fail("image", Phase::TargetsChecked, error)),
            }
        }
        report.director_phase = Phase::CrossValidated;

        let mut installed = trusted.installed.clone();
        for artifact in verified {
            let stored_at = self
                .store_artifact(&artifact.path, &artifact.content)
                .map_err(|e| fail("client", Phase::CrossValidated, e))?;
            installed.insert(
                artifact.ecu_serial.clone(),
                InstalledImage::describe(&artifact.path, &artifact.content),
            );
            report.authorized.push(AuthorizedArtifact {
                path: artifact.path,
                ecu_serial: artifact.ecu_serial,
                length: artifact.content.len() as u64,
                stored_at,
            });
        }

        let state = TrustedState {
            director: director.trust,
            image: image.trust,
            installed,
        };
        self.store
            .save(&state)
            .map_err(|e| fail("client", Phase::CrossValidated, e))?;
        report.director_phase = Phase::ArtifactsAuthorized;
        report.image_phase = Phase::ArtifactsAuthorized;
        info!(
            authorized = report.authorized.len(),
            rejected = report.rejected.len(),
            "update cycle committed"
        );
        Ok(report)
    }

    /// Fetch an artifact from the Image repository and check it against the
    /// Director's entry.
    fn download(&self, path: &str, target: &TargetFile) -> Result<Vec<u8>> {
        let name = format!("{TARGETS_DIR}/{path}");
        let content = self
            .image
            .fetch(&name, target.length)
            .map_err(|source| Error::Fetch { name: name.clone(), source })?;
        let actual = content.len() as u64;
        if actual != target.length {
            return Err(Error::LengthMismatch {
                what: path.to_string(),
                expected: target.length,
                actual,
            });
        }
        hash::verify_hashes(path, &content, &target.hashes)?;
        Ok(content)
    }

    fn store_artifact(&self, path: &str, content: &[u8]) -> Result<PathBuf> {
        let dest = resolve_target_path(&self.targets_dir, path)?;
        let parent = dest.parent().unwrap_or(&self.targets_dir);
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        let mut file = NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
        file.write_all(content).map_err(|e| Error::io(file.path(), e))?;
        file.persist(&dest).map_err(|e| Error::io(&dest, e.error))?;
        Ok(dest)
    }
}

/// The Image repository must list `path` with the same length and the same
/// hash set as the Director, and that set must be one we can check.
fn cross_validate(path: &str, directed: &TargetFile, catalog: Option<&Targets>) -> Result<()> {
    let mismatch = |reason: String| Error::CrossRepositoryMismatch {
        path: path.to_string(),
        reason,
    };
    if !hash::any_supported(&directed.hashes) {
        return Err(mismatch(format!(
            "no supported hash algorithm (need {} or {})",
            hash::SHA256,
            hash::SHA512
        )));
    }
    let Some(listed) = catalog.and_then(|c| c.targets.get(path)) else {
        return Err(mismatch("absent from image repository".into()));
    };
    if listed.length != directed.length {
        return Err(mismatch(format!(
            "length {} in director, {} in image repository",
            directed.length, listed.length
        )));
    }
    hash::compare_hashes(path, &directed.hashes, &listed.hashes)
        .and_then(|()| hash::compare_hashes(path, &listed.hashes, &directed.hashes))
        .map_err(|e| mismatch(e.to_string()))
}
