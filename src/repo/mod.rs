// mod.rs — Repository state machine
//
// Every mutation computes the next (targets, snapshot, timestamp) versions
// from what is on disk, signs and self-verifies all new metadata, stages
// every file, and only then renames them into place: artifact, targets,
// snapshot, and timestamp.json last. A reader following timestamp.json can
// therefore never reach a file that is not yet durable.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{EngineConfig, RoleTtls};
use crate::error::{Error, Result};
use crate::sign::{self, KeyPair, KeyStore};
use crate::tuf::model::{
    expires_in, MetaFile, Role, RoleKeys, RoleType, Root, Signed, Snapshot, TargetFile, Targets,
    Timestamp, TIMESTAMP_FILE,
};
use crate::tuf::verify;

use store::MetadataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Image,
    Director,
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepoKind::Image => "image",
            RepoKind::Director => "director",
        })
    }
}

/// Versions in effect after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleVersions {
    pub root: u64,
    pub targets: u64,
    pub snapshot: u64,
    pub timestamp: u64,
}

pub type RepoUpdateResult = RoleVersions;

/// What the resigner re-issued.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResignReport {
    pub reissued: Vec<(RoleType, u64)>,
    pub versions: RoleVersions,
}

/// Snapshot of the published metadata, read from disk under the lock.
struct RepoState {
    root: Signed<Root>,
    timestamp: Option<Signed<Timestamp>>,
    snapshot: Option<Signed<Snapshot>>,
    targets: Option<Signed<Targets>>,
}

impl RepoState {
    fn versions(&self) -> RoleVersions {
        RoleVersions {
            root: self.root.signed.version,
            targets: self.targets.as_ref().map_or(0, |t| t.signed.version),
            snapshot: self.snapshot.as_ref().map_or(0, |s| s.signed.version),
            timestamp: self.timestamp.as_ref().map_or(0, |t| t.signed.version),
        }
    }

    fn entries(&self) -> BTreeMap<String, TargetFile> {
        self.targets
            .as_ref()
            .map(|t| t.signed.targets.clone())
            .unwrap_or_default()
    }
}

/// Signed, encoded metadata waiting to be staged.
struct Pending {
    role: RoleType,
    version: u64,
    bytes: Vec<u8>,
}

/// One Image or Director repository rooted at a directory.
///
/// All mutations are serialized by an internal mutex, which also owns the
/// signing keys. Use one instance per directory.
pub struct Repository {
    kind: RepoKind,
    store: MetadataStore,
    config: EngineConfig,
    keys: Mutex<KeyStore>,
}

impl Repository {
    /// Create `1.root.json` for a new repository.
    pub fn init(dir: &Path, kind: RepoKind, keys: KeyStore, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let repo = Repository {
            kind,
            store: MetadataStore::new(dir),
            config,
            keys: Mutex::new(keys),
        };
        if let Some(version) = repo.store.latest_root_version()? {
            return Err(Error::Config(format!(
                "{} already holds root version {version}",
                dir.display()
            )));
        }
        let keys = repo.lock();
        let root = repo.build_root(&keys, 1, Utc::now())?;
        let signed = sign::sign_payload(root, keys.keys(RoleType::Root))?;
        verify::verify_pinned_root(&signed)?;
        let mut batch = repo.store.batch();
        batch.stage_versioned(RoleType::Root, 1, &signed.to_canonical_bytes()?)?;
        batch.commit()?;
        info!(repo = %kind, dir = %dir.display(), "initialized repository");
        drop(keys);
        Ok(repo)
    }

    /// Open an initialized repository.
    pub fn open(dir: &Path, kind: RepoKind, keys: KeyStore, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = MetadataStore::new(dir);
        if store.latest_root_version()?.is_none() {
            return Err(Error::NotInitialized(format!(
                "{kind} repository at {}",
                dir.display()
            )));
        }
        Ok(Repository {
            kind,
            store,
            config,
            keys: Mutex::new(keys),
        })
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn current_versions(&self) -> Result<RoleVersions> {
        let _keys = self.lock();
        Ok(self.load_state()?.versions())
    }

    /// The current entry for `path`, if published.
    pub fn target(&self, path: &str) -> Result<Option<TargetFile>> {
        let _keys = self.lock();
        Ok(self.load_state()?.entries().remove(path))
    }

    /// Store `content` under `path` and publish the next triple listing it.
    pub fn publish_target(
        &self,
        path: &str,
        content: &[u8],
        ecu_binding: Option<&str>,
    ) -> Result<RepoUpdateResult> {
        let info = TargetFile::describe(content).bound_to(ecu_binding);
        self.update_targets(path, Some(content), |entries| {
            entries.insert(path.to_string(), info);
            Ok(())
        })
    }

    /// Publish the next triple listing `info` for `path` without storing
    /// content, as the Director does when assigning an image the Image
    /// repository already holds.
    pub fn publish_target_info(
        &self,
        path: &str,
        info: TargetFile,
        ecu_binding: Option<&str>,
    ) -> Result<RepoUpdateResult> {
        let info = info.bound_to(ecu_binding);
        self.update_targets(path, None, |entries| {
            entries.insert(path.to_string(), info);
            Ok(())
        })
    }

    /// Publish the next triple without `path`.
    pub fn remove_target(&self, path: &str) -> Result<RepoUpdateResult> {
        self.update_targets(path, None, |entries| {
            entries
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Error::InvalidTargetPath(path.to_string()))
        })
    }

    fn update_targets(
        &self,
        path: &str,
        content: Option<&[u8]>,
        edit: impl FnOnce(&mut BTreeMap<String, TargetFile>) -> Result<()>,
    ) -> Result<RepoUpdateResult> {
        self.store.artifact_path(path)?;
        let keys = self.lock();
        let state = self.load_state()?;
        let mut entries = state.entries();
        edit(&mut entries)?;

        let now = Utc::now();
        let pending = self.sign_triple(&keys, &state, entries, now)?;

        let mut batch = self.store.batch();
        if let Some(content) = content {
            batch.stage_artifact(path, content)?;
        }
        let versions = self.stage(&mut batch, &state, &pending)?;
        batch.commit()?;
        info!(
            repo = %self.kind,
            path,
            targets = versions.targets,
            snapshot = versions.snapshot,
            timestamp = versions.timestamp,
            "published targets"
        );
        Ok(versions)
    }

    /// Re-issue only Timestamp, pointing at the unchanged Snapshot.
    pub fn resign_timestamp(&self) -> Result<RepoUpdateResult> {
        let keys = self.lock();
        let state = self.load_state()?;
        let pending = vec![self.sign_timestamp(&keys, &state, Utc::now())?];
        let mut batch = self.store.batch();
        let versions = self.stage(&mut batch, &state, &pending)?;
        batch.commit()?;
        info!(repo = %self.kind, timestamp = versions.timestamp, "re-signed timestamp");
        Ok(versions)
    }

    /// Re-issue every role that expires within the configured window of
    /// `now`. A re-issued role drags every role above it along.
    pub fn resign_expiring(&self, now: DateTime<Utc>) -> Result<ResignReport> {
        let keys = self.lock();
        let state = self.load_state()?;
        let deadline = now + self.config.resign_window();
        let expiring = |expires: Option<DateTime<Utc>>| expires.is_some_and(|e| e <= deadline);

        let mut pending = Vec::new();
        if state.root.signed.expires <= deadline {
            let root = self.build_root(&keys, state.root.signed.version + 1, now)?;
            pending.push(self.sign_root(&keys, &state.root.signed, root)?);
        }
        if expiring(state.targets.as_ref().map(|t| t.signed.expires)) {
            pending.extend(self.sign_triple(&keys, &state, state.entries(), now)?);
        } else if expiring(state.snapshot.as_ref().map(|s| s.signed.expires)) {
            pending.extend(self.sign_snapshot_and_timestamp(&keys, &state, now)?);
        } else if expiring(state.timestamp.as_ref().map(|t| t.signed.expires)) {
            pending.push(self.sign_timestamp(&keys, &state, now)?);
        }

        if pending.is_empty() {
            debug!(repo = %self.kind, "nothing expires within the resign window");
            return Ok(ResignReport {
                reissued: Vec::new(),
                versions: state.versions(),
            });
        }
        let mut batch = self.store.batch();
        let versions = self.stage(&mut batch, &state, &pending)?;
        batch.commit()?;
        let reissued: Vec<_> = pending.iter().map(|p| (p.role, p.version)).collect();
        info!(repo = %self.kind, ?reissued, "re-signed expiring metadata");
        Ok(ResignReport { reissued, versions })
    }

    /// Replace every signing key. The new Root is signed by the old and new
    /// root keys so clients can walk to it; the triple is then re-issued
    /// under the new keys.
    pub fn rotate_root(&self, new_keys: KeyStore) -> Result<RepoUpdateResult> {
        let mut keys = self.lock();
        let state = self.load_state()?;
        let now = Utc::now();

        let root = self.build_root(&new_keys, state.root.signed.version + 1, now)?;
        let mut signers: Vec<KeyPair> = keys.keys(RoleType::Root).to_vec();
        signers.extend_from_slice(new_keys.keys(RoleType::Root));
        let signed_root = sign::sign_payload(root, &signers)?;
        verify::verify_root_update(&state.root.signed, &signed_root, state.root.signed.version + 1)?;

        let rotated = RepoState {
            root: signed_root,
            timestamp: state.timestamp.clone(),
            snapshot: state.snapshot.clone(),
            targets: state.targets.clone(),
        };
        let mut pending = vec![Pending {
            role: RoleType::Root,
            version: rotated.root.signed.version,
            bytes: rotated.root.to_canonical_bytes()?,
        }];
        if rotated.timestamp.is_some() {
            pending.extend(self.sign_triple(&new_keys, &rotated, rotated.entries(), now)?);
        }

        let mut batch = self.store.batch();
        let versions = self.stage(&mut batch, &state, &pending)?;
        batch.commit()?;
        *keys = new_keys;
        info!(repo = %self.kind, root = versions.root, "rotated root keys");
        Ok(versions)
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, KeyStore> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ttls(&self) -> &RoleTtls {
        match self.kind {
            RepoKind::Image => &self.config.image_ttl_days,
            RepoKind::Director => &self.config.director_ttl_days,
        }
    }

    fn expiry(&self, role: RoleType, now: DateTime<Utc>) -> DateTime<Utc> {
        expires_in(now, self.ttls().days(role))
    }

    fn load_state(&self) -> Result<RepoState> {
        let root_version = self.store.latest_root_version()?.ok_or_else(|| {
            Error::NotInitialized(format!("{} repository at {}", self.kind, self.dir().display()))
        })?;
        let root = self.store.require_role::<Root>(root_version)?;
        let Some(timestamp) = self.store.read_role::<Timestamp>(TIMESTAMP_FILE)? else {
            return Ok(RepoState {
                root,
                timestamp: None,
                snapshot: None,
                targets: None,
            });
        };
        let snapshot = self
            .store
            .require_role::<Snapshot>(timestamp.signed.snapshot_meta()?.version)?;
        let targets = self
            .store
            .require_role::<Targets>(snapshot.signed.targets_meta()?.version)?;
        Ok(RepoState {
            root,
            timestamp: Some(timestamp),
            snapshot: Some(snapshot),
            targets: Some(targets),
        })
    }

    fn build_root(&self, keys: &KeyStore, version: u64, now: DateTime<Utc>) -> Result<Root> {
        let mut public_keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for role in RoleType::ALL {
            let mut keyids = Vec::new();
            for key in signing_keys(keys, role)? {
                let key_id = key.key_id()?;
                public_keys.insert(key_id.clone(), key.public_key());
                keyids.push(key_id);
            }
            roles.insert(
                role,
                RoleKeys {
                    keyids,
                    threshold: self.config.thresholds.get(role),
                },
            );
        }
        Ok(Root {
            role_type: RoleType::Root,
            spec_version: self.config.spec_version.clone(),
            consistent_snapshot: true,
            version,
            expires: self.expiry(RoleType::Root, now),
            keys: public_keys,
            roles,
        })
    }

    /// Re-sign an unchanged key set as the next Root version.
    fn sign_root(&self, keys: &KeyStore, trusted: &Root, root: Root) -> Result<Pending> {
        let version = root.version;
        let signed = sign::sign_payload(root, signing_keys(keys, RoleType::Root)?)?;
        verify::verify_root_update(trusted, &signed, version)?;
        Ok(Pending {
            role: RoleType::Root,
            version,
            bytes: signed.to_canonical_bytes()?,
        })
    }

    /// Sign `payload` with the role's keys and check the result against the
    /// Root clients will verify it with.
    fn sign_role<T: Role>(&self, keys: &KeyStore, root: &Root, payload: T) -> Result<Pending> {
        let version = payload.version();
        let signed = sign::sign_payload(payload, signing_keys(keys, T::TYPE)?)?;
        verify::verify_role(&signed, root)?;
        Ok(Pending {
            role: T::TYPE,
            version,
            bytes: signed.to_canonical_bytes()?,
        })
    }

    fn sign_triple(
        &self,
        keys: &KeyStore,
        state: &RepoState,
        entries: BTreeMap<String, TargetFile>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pending>> {
        let root = &state.root.signed;
        let versions = state.versions();
        let spec = &self.config.spec_version;

        let targets = self.sign_role(
            keys,
            root,
            Targets::new(spec, versions.targets + 1, self.expiry(RoleType::Targets, now), entries),
        )?;
        let snapshot = self.sign_role(
            keys,
            root,
            Snapshot::new(
                spec,
                versions.snapshot + 1,
                self.expiry(RoleType::Snapshot, now),
                MetaFile::describe(targets.version, &targets.bytes),
            ),
        )?;
        let timestamp = self.sign_role(
            keys,
            root,
            Timestamp::new(
                spec,
                versions.timestamp + 1,
                self.expiry(RoleType::Timestamp, now),
                MetaFile::describe(snapshot.version, &snapshot.bytes),
            ),
        )?;
        Ok(vec![targets, snapshot, timestamp])
    }

    fn sign_snapshot_and_timestamp(
        &self,
        keys: &KeyStore,
        state: &RepoState,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pending>> {
        let (Some(snapshot), Some(timestamp)) = (&state.snapshot, &state.timestamp) else {
            return Err(self.nothing_published());
        };
        let spec = &self.config.spec_version;
        let snapshot = self.sign_role(
            keys,
            &state.root.signed,
            Snapshot::new(
                spec,
                snapshot.signed.version + 1,
                self.expiry(RoleType::Snapshot, now),
                snapshot.signed.targets_meta()?.clone(),
            ),
        )?;
        let timestamp = self.sign_role(
            keys,
            &state.root.signed,
            Timestamp::new(
                spec,
                timestamp.signed.version + 1,
                self.expiry(RoleType::Timestamp, now),
                MetaFile::describe(snapshot.version, &snapshot.bytes),
            ),
        )?;
        Ok(vec![snapshot, timestamp])
    }

    fn sign_timestamp(&self, keys: &KeyStore, state: &RepoState, now: DateTime<Utc>) -> Result<Pending> {
        let Some(timestamp) = &state.timestamp else {
            return Err(self.nothing_published());
        };
        self.sign_role(
            keys,
            &state.root.signed,
            Timestamp::new(
                &self.config.spec_version,
                timestamp.signed.version + 1,
                self.expiry(RoleType::Timestamp, now),
                timestamp.signed.snapshot_meta()?.clone(),
            ),
        )
    }

    /// Stage `pending` in order and report the versions that will be in
    /// effect once the batch commits.
    fn stage(
        &self,
        batch: &mut store::Batch<'_>,
        state: &RepoState,
        pending: &[Pending],
    ) -> Result<RoleVersions> {
        let mut versions = state.versions();
        for file in pending {
            match file.role {
                RoleType::Timestamp => batch.stage_latest(TIMESTAMP_FILE, &file.bytes)?,
                role => batch.stage_versioned(role, file.version, &file.bytes)?,
            }
            match file.role {
                RoleType::Root => versions.root = file.version,
                RoleType::Targets => versions.targets = file.version,
                RoleType::Snapshot => versions.snapshot = file.version,
                RoleType::Timestamp => versions.timestamp = file.version,
            }
        }
        Ok(versions)
    }

    fn nothing_published(&self) -> Error {
        Error::NotInitialized(format!("{} repository has no published targets", self.kind))
    }
}

fn signing_keys(keys: &KeyStore, role: RoleType) -> Result<&[KeyPair]> {
    let signers = keys.keys(role);
    if signers.is_empty() {
        return Err(Error::InvalidKey(format!("no {role} signing key loaded")));
    }
    Ok(signers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use chrono::Duration;

    use crate::hash;

    fn new_repo(dir: &Path) -> Repository {
        Repository::init(dir, RepoKind::Image, KeyStore::generate(1), EngineConfig::default())
            .unwrap()
    }

    fn read<T: Role>(dir: &Path, name: &str) -> (Signed<T>, Vec<u8>) {
        let bytes = std::fs::read(dir.join(name)).unwrap();
        (Signed::<T>::from_slice(name, &bytes).unwrap(), bytes)
    }

    #[test]
    fn init_writes_self_signed_root() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        let (root, _) = read::<Root>(dir.path(), "1.root.json");
        verify::verify_pinned_root(&root).unwrap();
        assert_eq!(repo.current_versions().unwrap(), RoleVersions { root: 1, ..Default::default() });
        assert!(!dir.path().join(TIMESTAMP_FILE).exists());
    }

    #[test]
    fn init_refuses_existing_repository() {
        let dir = tempfile::tempdir().unwrap();
        new_repo(dir.path());
        let again = Repository::init(
            dir.path(),
            RepoKind::Image,
            KeyStore::generate(1),
            EngineConfig::default(),
        );
        assert!(again.is_err());
    }

    #[test]
    fn publish_two_targets_chains_versions_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());

        let first = repo.publish_target("a.txt", b"hi", None).unwrap();
        assert_eq!((first.targets, first.snapshot, first.timestamp), (1, 1, 1));
        let (targets1, targets1_bytes) = read::<Targets>(dir.path(), "1.targets.json");
        let (snapshot1, snapshot1_bytes) = read::<Snapshot>(dir.path(), "1.snapshot.json");
        let (timestamp1, _) = read::<Timestamp>(dir.path(), TIMESTAMP_FILE);
        assert_eq!(targets1.signed.targets["a.txt"].hashes[hash::SHA256], hash::sha256_hex(b"hi"));
        assert_eq!(snapshot1.signed.targets_meta().unwrap(), &MetaFile::describe(1, &targets1_bytes));
        assert_eq!(timestamp1.signed.snapshot_meta().unwrap(), &MetaFile::describe(1, &snapshot1_bytes));

        let second = repo.publish_target("b.txt", b"yo", None).unwrap();
        assert_eq!((second.targets, second.snapshot, second.timestamp), (2, 2, 2));
        let (targets2, targets2_bytes) = read::<Targets>(dir.path(), "2.targets.json");
        let names: Vec<_> = targets2.signed.targets.keys().cloned().collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        let (snapshot2, snapshot2_bytes) = read::<Snapshot>(dir.path(), "2.snapshot.json");
        let (timestamp2, _) = read::<Timestamp>(dir.path(), TIMESTAMP_FILE);
        assert_eq!(snapshot2.signed.targets_meta().unwrap(), &MetaFile::describe(2, &targets2_bytes));
        assert_eq!(timestamp2.signed.snapshot_meta().unwrap(), &MetaFile::describe(2, &snapshot2_bytes));

        // superseded versions stay on disk unchanged
        assert_eq!(std::fs::read(dir.path().join("1.targets.json")).unwrap(), targets1_bytes);
        assert_eq!(std::fs::read(dir.path().join("targets/b.txt")).unwrap(), b"yo");
    }

    #[test]
    fn concurrent_publishes_get_distinct_gap_free_versions() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(new_repo(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    repo.publish_target(&format!("fw/{i}.bin"), format!("image {i}").as_bytes(), None)
                        .unwrap()
                        .targets
                })
            })
            .collect();
        let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());

        let (targets, _) = read::<Targets>(dir.path(), "8.targets.json");
        assert_eq!(targets.signed.targets.len(), 8);
        let current = repo.current_versions().unwrap();
        assert_eq!((current.targets, current.snapshot, current.timestamp), (8, 8, 8));
    }

    #[test]
    fn missing_signing_key_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let full = KeyStore::generate(1);
        Repository::init(dir.path(), RepoKind::Image, full.clone(), EngineConfig::default())
            .unwrap();
        let mut partial = full;
        partial.set(RoleType::Timestamp, Vec::new());
        let repo =
            Repository::open(dir.path(), RepoKind::Image, partial, EngineConfig::default()).unwrap();

        assert!(repo.publish_target("a.txt", b"hi", None).is_err());
        assert!(!dir.path().join("1.targets.json").exists());
        assert!(!dir.path().join("1.snapshot.json").exists());
        assert!(!dir.path().join("targets/a.txt").exists());
    }

    #[test]
    fn foreign_keys_are_caught_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        new_repo(dir.path());
        let repo = Repository::open(
            dir.path(),
            RepoKind::Image,
            KeyStore::generate(1),
            EngineConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            repo.publish_target("a.txt", b"hi", None).unwrap_err(),
            Error::Signature { .. }
        ));
        assert!(!dir.path().join("1.targets.json").exists());
    }

    #[test]
    fn resign_timestamp_keeps_snapshot_pin() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.publish_target("a.txt", b"hi", None).unwrap();
        let (before, _) = read::<Timestamp>(dir.path(), TIMESTAMP_FILE);

        let versions = repo.resign_timestamp().unwrap();
        assert_eq!((versions.targets, versions.snapshot, versions.timestamp), (1, 1, 2));
        let (after, _) = read::<Timestamp>(dir.path(), TIMESTAMP_FILE);
        assert_eq!(after.signed.version, 2);
        assert_eq!(after.signed.snapshot_meta().unwrap(), before.signed.snapshot_meta().unwrap());
    }

    #[test]
    fn resign_timestamp_requires_published_targets() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        assert!(matches!(repo.resign_timestamp().unwrap_err(), Error::NotInitialized(_)));
    }

    #[test]
    fn director_binding_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(
            dir.path(),
            RepoKind::Director,
            KeyStore::generate(1),
            EngineConfig::default(),
        )
        .unwrap();
        repo.publish_target_info("fw/v2.bin", TargetFile::describe(b"v2"), Some("ECU1"))
            .unwrap();
        assert_eq!(
            repo.target("fw/v2.bin").unwrap().unwrap().ecu_serial(),
            Some("ECU1")
        );
        assert!(!dir.path().join("targets/fw/v2.bin").exists());

        let versions = repo.remove_target("fw/v2.bin").unwrap();
        assert_eq!(versions.targets, 2);
        assert_eq!(repo.target("fw/v2.bin").unwrap(), None);
        assert!(repo.remove_target("fw/v2.bin").is_err());
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        assert!(matches!(
            repo.publish_target("../escape", b"x", None).unwrap_err(),
            Error::InvalidTargetPath(_)
        ));
    }

    #[test]
    fn resigner_reissues_only_what_expires() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.publish_target("a.txt", b"hi", None).unwrap();

        let quiet = repo.resign_expiring(Utc::now() - Duration::days(1)).unwrap();
        assert!(quiet.reissued.is_empty());

        // Timestamp lives one day: within the 24h window right away.
        let ts_only = repo.resign_expiring(Utc::now()).unwrap();
        assert_eq!(ts_only.reissued, vec![(RoleType::Timestamp, 2)]);

        // Eight days out, targets and everything above them expire.
        let all = repo.resign_expiring(Utc::now() + Duration::days(8)).unwrap();
        assert_eq!(
            all.reissued,
            vec![(RoleType::Targets, 2), (RoleType::Snapshot, 2), (RoleType::Timestamp, 3)]
        );

        // A year out, root goes too.
        let year = repo.resign_expiring(Utc::now() + Duration::days(366)).unwrap();
        assert_eq!(year.reissued[0], (RoleType::Root, 2));
        assert_eq!(year.versions.root, 2);
        let (root2, _) = read::<Root>(dir.path(), "2.root.json");
        let (root1, _) = read::<Root>(dir.path(), "1.root.json");
        verify::verify_root_update(&root1.signed, &root2, 2).unwrap();
    }

    #[test]
    fn rotate_root_is_signed_by_old_and_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.publish_target("a.txt", b"hi", None).unwrap();

        let new_keys = KeyStore::generate(1);
        let versions = repo.rotate_root(new_keys.clone()).unwrap();
        assert_eq!((versions.root, versions.targets, versions.timestamp), (2, 2, 2));

        let (root1, _) = read::<Root>(dir.path(), "1.root.json");
        let (root2, _) = read::<Root>(dir.path(), "2.root.json");
        verify::verify_root_update(&root1.signed, &root2, 2).unwrap();

        let (targets2, _) = read::<Targets>(dir.path(), "2.targets.json");
        verify::verify_role(&targets2, &root2.signed).unwrap();
        assert!(verify::verify_role(&targets2, &root1.signed).is_err());

        // later publishes use the new keys
        repo.publish_target("b.txt", b"yo", None).unwrap();
        let (targets3, _) = read::<Targets>(dir.path(), "3.targets.json");
        verify::verify_role(&targets3, &root2.signed).unwrap();
    }
}
