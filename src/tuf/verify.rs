// verify.rs — Role-level checks against a trusted Root
//
// Every check here is a pure function of (bytes, trusted state, now). The
// client composes them into the update cycle; nothing here touches disk.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::hash;
use crate::sign;
use crate::tuf::canonical;
use crate::tuf::model::{is_canonical_key_hex, MetaFile, PublicKey, Role, RoleType, Root, Signed};

/// Keys authorized for `role` by `root`, with the role's threshold.
pub fn role_keys(root: &Root, role: RoleType) -> Result<(BTreeMap<String, PublicKey>, u64)> {
    let declared = root.roles.get(&role).ok_or_else(|| Error::MissingMeta {
        role: RoleType::Root,
        entry: format!("roles.{role}"),
    })?;
    let mut keys = BTreeMap::new();
    for key_id in &declared.keyids {
        let key = root.keys.get(key_id).ok_or_else(|| Error::UnknownRoleKey {
            role: role.to_string(),
            key_id: key_id.clone(),
        })?;
        keys.insert(key_id.clone(), key.clone());
    }
    Ok((keys, declared.threshold))
}

/// Structural checks on a Root: self-describing key ids, role key references
/// and satisfiable thresholds for all four roles.
pub fn validate_root(root: &Root) -> Result<()> {
    if root.version == 0 {
        return Err(Error::InvalidRoot("version must be at least 1".into()));
    }
    for (key_id, key) in &root.keys {
        if !is_canonical_key_hex(&key.keyval.public) {
            return Err(Error::InvalidKey(format!(
                "key {key_id} is not 64 lowercase hex digits"
            )));
        }
        if &key.key_id()? != key_id {
            return Err(Error::UnknownRoleKey {
                role: RoleType::Root.to_string(),
                key_id: key_id.clone(),
            });
        }
    }
    for role in RoleType::ALL {
        let (keys, threshold) = role_keys(root, role)?;
        if threshold == 0 {
            return Err(Error::InvalidRoot(format!("{role} threshold must be at least 1")));
        }
        let mut distinct = BTreeSet::new();
        for key in keys.values() {
            if !distinct.insert(sign::key_material(key)?) {
                return Err(Error::InvalidRoot(format!(
                    "{role} lists the same key under more than one id"
                )));
            }
        }
        if (distinct.len() as u64) < threshold {
            return Err(Error::InvalidRoot(format!(
                "{role} threshold {threshold} exceeds its {} distinct keys",
                distinct.len()
            )));
        }
    }
    Ok(())
}

/// Signature threshold check of any role against `root`.
pub fn verify_role<T: Role>(signed: &Signed<T>, root: &Root) -> Result<()> {
    let bytes = canonical::encode(&signed.signed)?;
    let (keys, threshold) = role_keys(root, T::TYPE)?;
    sign::verify_threshold(T::TYPE.as_str(), &bytes, &signed.signatures, &keys, threshold)?;
    Ok(())
}

/// A first Root, trusted out of band: structurally valid and self-signed.
pub fn verify_pinned_root(signed: &Signed<Root>) -> Result<()> {
    validate_root(&signed.signed)?;
    verify_role(signed, &signed.signed)
}

/// A Root `expected_version` succeeding `trusted`: signed to threshold by the
/// trusted root keys and by its own.
pub fn verify_root_update(trusted: &Root, candidate: &Signed<Root>, expected_version: u64) -> Result<()> {
    let received = candidate.signed.version;
    if received < expected_version {
        return Err(Error::Rollback {
            role: RoleType::Root,
            trusted: expected_version - 1,
            received,
        });
    }
    if received != expected_version {
        return Err(Error::VersionMismatch {
            role: RoleType::Root,
            expected: expected_version,
            actual: received,
        });
    }
    validate_root(&candidate.signed)?;
    verify_role(candidate, trusted)?;
    verify_role(candidate, &candidate.signed)
}

pub fn check_expiry<T: Role>(payload: &T, now: DateTime<Utc>) -> Result<()> {
    if payload.expires() <= now {
        return Err(Error::ExpiredMetadata {
            role: T::TYPE,
            version: payload.version(),
            expires: payload.expires().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    }
    Ok(())
}

pub fn check_rollback(role: RoleType, trusted: Option<u64>, received: u64) -> Result<()> {
    match trusted {
        Some(trusted) if received < trusted => Err(Error::Rollback {
            role,
            trusted,
            received,
        }),
        _ => Ok(()),
    }
}

/// Parse a metadata file fetched because `pin` pointed at it: the exact
/// bytes must match the pinned hashes and length before they are even
/// parsed, and the parsed version must be the pinned one.
pub fn verify_pinned<T: Role>(name: &str, bytes: &[u8], pin: &MetaFile) -> Result<Signed<T>> {
    hash::verify_hashes(name, bytes, &pin.hashes)?;
    let actual = bytes.len() as u64;
    if actual != pin.length {
        return Err(Error::LengthMismatch {
            what: name.to_string(),
            expected: pin.length,
            actual,
        });
    }
    let signed = Signed::<T>::from_slice(name, bytes)?;
    if signed.signed.version() != pin.version {
        return Err(Error::VersionMismatch {
            role: T::TYPE,
            expected: pin.version,
            actual: signed.signed.version(),
        });
    }
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::{sign_payload, KeyPair, KeyStore};
    use crate::tuf::model::{expires_in, RoleKeys, Snapshot, Targets};
    use chrono::Duration;

    fn root_for(store: &KeyStore, version: u64) -> Root {
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for role in RoleType::ALL {
            let mut keyids = Vec::new();
            for key in store.keys(role) {
                let id = key.key_id().unwrap();
                keys.insert(id.clone(), key.public_key());
                keyids.push(id);
            }
            roles.insert(role, RoleKeys { keyids, threshold: 1 });
        }
        Root {
            role_type: RoleType::Root,
            spec_version: "1.0.0".into(),
            consistent_snapshot: true,
            version,
            expires: expires_in(Utc::now(), 365),
            keys,
            roles,
        }
    }

    fn signed_targets(store: &KeyStore, version: u64) -> Signed<Targets> {
        let payload = Targets::new("1.0.0", version, expires_in(Utc::now(), 7), BTreeMap::new());
        sign_payload(payload, store.keys(RoleType::Targets)).unwrap()
    }

    #[test]
    fn targets_signed_by_targets_key_verify() {
        let store = KeyStore::generate(1);
        let root = root_for(&store, 1);
        validate_root(&root).unwrap();
        verify_role(&signed_targets(&store, 1), &root).unwrap();
    }

    #[test]
    fn targets_signed_by_snapshot_key_fail() {
        let store = KeyStore::generate(1);
        let root = root_for(&store, 1);
        let payload = Targets::new("1.0.0", 1, expires_in(Utc::now(), 7), BTreeMap::new());
        let signed = sign_payload(payload, store.keys(RoleType::Snapshot)).unwrap();
        assert!(matches!(
            verify_role(&signed, &root).unwrap_err(),
            Error::Signature { .. }
        ));
    }

    #[test]
    fn validate_root_rejects_one_key_spelled_twice() {
        let store = KeyStore::generate(1);
        let mut root = root_for(&store, 1);
        let key = store.keys(RoleType::Targets)[0].public_key();
        let mut upper = key.clone();
        upper.keyval.public = key.keyval.public.to_ascii_uppercase();
        let upper_id = upper.key_id().unwrap();
        root.keys.insert(upper_id.clone(), upper);
        let targets = root.roles.get_mut(&RoleType::Targets).unwrap();
        targets.keyids.push(upper_id);
        targets.threshold = 2;
        assert!(matches!(validate_root(&root).unwrap_err(), Error::InvalidKey(_)));

        // Signed once, with the signature copied under the second id.
        let signed = signed_targets(&store, 1);
        let mut forged = signed.clone();
        let mut copy = signed.signatures[0].clone();
        copy.keyid = root.roles[&RoleType::Targets].keyids[1].clone();
        forged.signatures.push(copy);
        assert!(matches!(
            verify_role(&forged, &root).unwrap_err(),
            Error::Signature { valid: 1, threshold: 2, .. }
        ));
    }

    #[test]
    fn repeated_key_id_counts_once_toward_threshold() {
        let store = KeyStore::generate(1);
        let mut root = root_for(&store, 1);
        let id = store.keys(RoleType::Snapshot)[0].key_id().unwrap();
        let snapshot = root.roles.get_mut(&RoleType::Snapshot).unwrap();
        snapshot.keyids.push(id);
        snapshot.threshold = 2;
        let err = validate_root(&root).unwrap_err();
        assert!(matches!(err, Error::InvalidRoot(_)), "{err}");
    }

    #[test]
    fn validate_root_rejects_aliased_key_id() {
        let store = KeyStore::generate(1);
        let mut root = root_for(&store, 1);
        let (id, key) = root.keys.pop_first().unwrap();
        root.keys.insert("alias".into(), key);
        let err = validate_root(&root).unwrap_err();
        assert!(matches!(err, Error::UnknownRoleKey { .. }), "{id}: {err}");
    }

    #[test]
    fn validate_root_rejects_undeclared_role_key() {
        let store = KeyStore::generate(1);
        let mut root = root_for(&store, 1);
        let stranger = KeyPair::generate().key_id().unwrap();
        root.roles.get_mut(&RoleType::Snapshot).unwrap().keyids = vec![stranger];
        assert!(matches!(
            validate_root(&root).unwrap_err(),
            Error::UnknownRoleKey { .. }
        ));
    }

    #[test]
    fn validate_root_rejects_unsatisfiable_threshold() {
        let store = KeyStore::generate(1);
        let mut root = root_for(&store, 1);
        root.roles.get_mut(&RoleType::Targets).unwrap().threshold = 2;
        assert!(matches!(validate_root(&root).unwrap_err(), Error::InvalidRoot(_)));
        root.roles.get_mut(&RoleType::Targets).unwrap().threshold = 0;
        assert!(matches!(validate_root(&root).unwrap_err(), Error::InvalidRoot(_)));
    }

    #[test]
    fn root_update_requires_both_key_sets() {
        let old = KeyStore::generate(1);
        let new = KeyStore::generate(1);
        let trusted = root_for(&old, 1);
        let next = root_for(&new, 2);

        let only_new = sign_payload(next.clone(), new.keys(RoleType::Root)).unwrap();
        assert!(verify_root_update(&trusted, &only_new, 2).is_err());

        let mut both_keys = old.keys(RoleType::Root).to_vec();
        both_keys.extend_from_slice(new.keys(RoleType::Root));
        let both = sign_payload(next, &both_keys).unwrap();
        verify_root_update(&trusted, &both, 2).unwrap();
    }

    #[test]
    fn root_update_rejects_older_version() {
        let store = KeyStore::generate(1);
        let trusted = root_for(&store, 3);
        let older = sign_payload(root_for(&store, 2), store.keys(RoleType::Root)).unwrap();
        assert!(matches!(
            verify_root_update(&trusted, &older, 4).unwrap_err(),
            Error::Rollback { role: RoleType::Root, trusted: 3, received: 2 }
        ));
    }

    #[test]
    fn expiry_and_rollback() {
        let store = KeyStore::generate(1);
        let targets = signed_targets(&store, 4).signed;
        check_expiry(&targets, Utc::now()).unwrap();
        let err = check_expiry(&targets, Utc::now() + Duration::days(8)).unwrap_err();
        assert!(matches!(err, Error::ExpiredMetadata { role: RoleType::Targets, .. }));

        check_rollback(RoleType::Targets, None, 1).unwrap();
        check_rollback(RoleType::Targets, Some(4), 4).unwrap();
        assert!(matches!(
            check_rollback(RoleType::Targets, Some(5), 4).unwrap_err(),
            Error::Rollback { .. }
        ));
    }

    #[test]
    fn pinned_file_must_match_exactly() {
        let store = KeyStore::generate(1);
        let payload = Snapshot::new(
            "1.0.0",
            2,
            expires_in(Utc::now(), 7),
            MetaFile::describe(2, b"targets"),
        );
        let signed = sign_payload(payload, store.keys(RoleType::Snapshot)).unwrap();
        let bytes = signed.to_canonical_bytes().unwrap();
        let pin = MetaFile::describe(2, &bytes);

        let parsed = verify_pinned::<Snapshot>("2.snapshot.json", &bytes, &pin).unwrap();
        assert_eq!(parsed, signed);

        let mut wrong_version = pin.clone();
        wrong_version.version = 3;
        assert!(matches!(
            verify_pinned::<Snapshot>("2.snapshot.json", &bytes, &wrong_version).unwrap_err(),
            Error::VersionMismatch { .. }
        ));

        let mut tampered = bytes.clone();
        let last = tampered.len() - 2;
        tampered[last] = b' ';
        assert!(matches!(
            verify_pinned::<Snapshot>("2.snapshot.json", &tampered, &pin).unwrap_err(),
            Error::HashMismatch { .. }
        ));

        tampered.push(b'\n');
        assert!(matches!(
            verify_pinned::<Snapshot>("2.snapshot.json", &tampered, &pin).unwrap_err(),
            Error::HashMismatch { .. }
        ));

        let mut wrong_length = pin.clone();
        wrong_length.length += 1;
        assert!(matches!(
            verify_pinned::<Snapshot>("2.snapshot.json", &bytes, &wrong_length).unwrap_err(),
            Error::LengthMismatch { .. }
        ));
    }
}
