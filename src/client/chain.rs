// chain.rs — Walk one repository from its trusted root down to Targets
//
// Root → Timestamp → Snapshot → Targets, stopping early when the Timestamp
// still points at the trusted Snapshot or the Snapshot still points at the
// trusted Targets. Nothing is committed here: the caller gets a candidate
// `RepoTrust` and decides whether the cycle as a whole succeeded.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::client::remote::Remote;
use crate::client::store::{RepoTrust, TrustedFile};
use crate::client::Phase;
use crate::error::{Error, FetchError, Result};
use crate::tuf::model::{
    MetaFile, Role, RoleType, Root, Signed, Snapshot, Targets, Timestamp, TIMESTAMP_FILE,
};
use crate::tuf::verify;

/// Upper bounds for files fetched before any pin describes them.
pub const MAX_ROOT_LENGTH: u64 = 512 * 1024;
pub const MAX_TIMESTAMP_LENGTH: u64 = 16 * 1024;

#[derive(Debug)]
pub(crate) struct Refreshed {
    pub trust: RepoTrust,
    pub targets_changed: bool,
}

/// Refresh the chain of one repository. `phase` records the last state
/// reached so that a failure can be reported against it.
pub(crate) fn refresh<R: Remote + ?Sized>(
    repo: &str,
    remote: &R,
    trusted: &RepoTrust,
    now: DateTime<Utc>,
    phase: &mut Phase,
) -> Result<Refreshed> {
    *phase = Phase::Idle;
    let root = update_root(repo, remote, &trusted.root, now)?;
    *phase = Phase::RootChecked;

    let timestamp: Signed<Timestamp> =
        fetch_unpinned(remote, TIMESTAMP_FILE, MAX_TIMESTAMP_LENGTH)?;
    verify::verify_role(&timestamp, &root.signed)?;
    verify::check_rollback(RoleType::Timestamp, trusted.timestamp_version(), timestamp.signed.version)?;
    verify::check_expiry(&timestamp.signed, now)?;
    let snapshot_pin = timestamp.signed.snapshot_meta()?.clone();
    verify::check_rollback(RoleType::Snapshot, trusted.snapshot_version(), snapshot_pin.version)?;
    *phase = Phase::TimestampChecked;
    debug!(repo, version = timestamp.signed.version, "timestamp verified");

    if let Some(current) = trusted.snapshot.as_ref().filter(|s| s.meta.satisfies(&snapshot_pin)) {
        verify::check_expiry(&current.metadata.signed, now)?;
        if let Some(targets) = &trusted.targets {
            verify::check_expiry(&targets.metadata.signed, now)?;
        }
        *phase = Phase::SnapshotUnchanged;
        debug!(repo, version = snapshot_pin.version, "snapshot unchanged");
        return Ok(Refreshed {
            trust: RepoTrust {
                root,
                timestamp: Some(timestamp),
                snapshot: trusted.snapshot.clone(),
                targets: trusted.targets.clone(),
            },
            targets_changed: false,
        });
    }

    let snapshot = fetch_pinned::<Snapshot, R>(remote, &snapshot_pin)?;
    verify::verify_role(&snapshot.metadata, &root.signed)?;
    verify::check_expiry(&snapshot.metadata.signed, now)?;
    let targets_pin = snapshot.metadata.signed.targets_meta()?.clone();
    verify::check_rollback(RoleType::Targets, trusted.targets_version(), targets_pin.version)?;
    *phase = Phase::SnapshotChecked;
    debug!(repo, version = snapshot_pin.version, "snapshot verified");

    if let Some(current) = trusted.targets.as_ref().filter(|t| t.meta.satisfies(&targets_pin)) {
        verify::check_expiry(&current.metadata.signed, now)?;
        *phase = Phase::TargetsUnchanged;
        debug!(repo, version = targets_pin.version, "targets unchanged");
        return Ok(Refreshed {
            trust: RepoTrust {
                root,
                timestamp: Some(timestamp),
                snapshot: Some(snapshot),
                targets: trusted.targets.clone(),
            },
            targets_changed: false,
        });
    }

    let targets = fetch_pinned::<Targets, R>(remote, &targets_pin)?;
    verify::verify_role(&targets.metadata, &root.signed)?;
    verify::check_expiry(&targets.metadata.signed, now)?;
    *phase = Phase::TargetsChecked;
    debug!(repo, version = targets_pin.version, "targets verified");

    Ok(Refreshed {
        trust: RepoTrust {
            root,
            timestamp: Some(timestamp),
            snapshot: Some(snapshot),
            targets: Some(targets),
        },
        targets_changed: true,
    })
}

/// Walk `<n+1>.root.json`, `<n+2>.root.json`, ... until the repository has
/// no newer root. Every step must be signed by the previous and the new root
/// keys; the root reached must not be expired.
fn update_root<R: Remote + ?Sized>(
    repo: &str,
    remote: &R,
    trusted: &Signed<Root>,
    now: DateTime<Utc>,
) -> Result<Signed<Root>> {
    let mut current = trusted.clone();
    loop {
        let next = current.signed.version + 1;
        let name = RoleType::Root.versioned_file(next);
        let bytes = match remote.fetch(&name, MAX_ROOT_LENGTH) {
            Ok(bytes) => bytes,
            Err(FetchError::NotFound) => break,
            Err(source) => return Err(Error::Fetch { name, source }),
        };
        let candidate = Signed::<Root>::from_slice(&name, &bytes)?;
        verify::verify_root_update(&current.signed, &candidate, next)?;
        debug!(repo, version = next, "root updated");
        current = candidate;
    }
    verify::check_expiry(&current.signed, now)?;
    Ok(current)
}

fn fetch_unpinned<T: Role, R: Remote + ?Sized>(remote: &R, name: &str, max_length: u64) -> Result<Signed<T>> {
    let bytes = remote.fetch(name, max_length).map_err(|source| Error::Fetch {
        name: name.to_string(),
        source,
    })?;
    Signed::<T>::from_slice(name, &bytes)
}

/// Fetch the file `pin` points at, never reading past the pinned length.
fn fetch_pinned<T: Role, R: Remote + ?Sized>(remote: &R, pin: &MetaFile) -> Result<TrustedFile<T>> {
    let name = T::TYPE.versioned_file(pin.version);
    let bytes = remote.fetch(&name, pin.length).map_err(|source| Error::Fetch {
        name: name.clone(),
        source,
    })?;
    let metadata = verify::verify_pinned::<T>(&name, &bytes, pin)?;
    Ok(TrustedFile {
        meta: MetaFile::describe(pin.version, &bytes),
        metadata,
    })
}
