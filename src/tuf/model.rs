// model.rs — Typed metadata payloads for the four TUF roles and the
// Uptane manifests.
//
// Every payload is validated at the deserialization boundary: unknown fields
// are rejected, and `_type` must name the role the caller asked for.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{self, Hashes};
use crate::tuf::canonical;

/// Meta key under which a Timestamp pins its Snapshot.
pub const SNAPSHOT_META: &str = "snapshot.json";
/// Meta key under which a Snapshot pins its Targets.
pub const TARGETS_META: &str = "targets.json";
/// Unversioned name of the latest Timestamp.
pub const TIMESTAMP_FILE: &str = "timestamp.json";

// ── Roles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Root,
    Timestamp,
    Snapshot,
    Targets,
}

impl RoleType {
    pub const ALL: [RoleType; 4] = [
        RoleType::Root,
        RoleType::Timestamp,
        RoleType::Snapshot,
        RoleType::Targets,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Timestamp => "timestamp",
            RoleType::Snapshot => "snapshot",
            RoleType::Targets => "targets",
        }
    }

    /// `<version>.<role>.json`, the persisted name of a versioned role file.
    pub fn versioned_file(self, version: u64) -> String {
        format!("{}.{}.json", version, self.as_str())
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common accessors for the four signed role payloads.
pub trait Role: Serialize + DeserializeOwned {
    const TYPE: RoleType;

    /// The `_type` the payload declares about itself.
    fn declared_type(&self) -> RoleType;

    fn version(&self) -> u64;

    fn expires(&self) -> DateTime<Utc>;
}

/// TUF timestamps are second-precision `YYYY-MM-DDTHH:MM:SSZ`.
pub(crate) mod tuf_date {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Expiry `days` after `now`, truncated to whole seconds so that the value
/// survives a serialization round trip unchanged.
pub fn expires_in(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    (now + Duration::days(days)).trunc_subsecs(0)
}

// ── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signed<T> {
    pub signed: T,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

impl<T: Serialize> Signed<T> {
    /// Canonical bytes of the whole envelope. This is the exact content of a
    /// published metadata file, and what length/hash pins are computed over.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::encode(self)
    }
}

impl<T: Role> Signed<T> {
    /// Parse a role file, rejecting unknown fields and a mismatched `_type`.
    pub fn from_slice(what: &str, bytes: &[u8]) -> Result<Self> {
        let parsed: Signed<T> =
            serde_json::from_slice(bytes).map_err(|e| Error::json(what, e))?;
        let declared = parsed.signed.declared_type();
        if declared != T::TYPE {
            return Err(Error::WrongRoleType {
                expected: T::TYPE,
                actual: declared,
            });
        }
        Ok(parsed)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Ed25519,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicKey {
    pub keytype: KeyType,
    pub scheme: SignatureScheme,
    pub keyval: KeyValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyValue {
    /// Hex-encoded 32-byte Ed25519 public key, lowercase.
    #[serde(deserialize_with = "key_hex::deserialize")]
    pub public: String,
}

/// Key ids hash the key's text, so only one spelling of a key is accepted.
mod key_hex {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let raw = String::deserialize(d)?;
        if !super::is_canonical_key_hex(&raw) {
            return Err(serde::de::Error::custom(
                "public key must be 64 lowercase hex digits",
            ));
        }
        Ok(raw)
    }
}

/// True for exactly 64 lowercase hex digits.
pub fn is_canonical_key_hex(text: &str) -> bool {
    text.len() == 64 && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl PublicKey {
    pub fn ed25519(public_hex: String) -> Self {
        PublicKey {
            keytype: KeyType::Ed25519,
            scheme: SignatureScheme::Ed25519,
            keyval: KeyValue {
                public: public_hex.to_ascii_lowercase(),
            },
        }
    }

    /// Self-describing key id: SHA-256 over the canonical key object.
    pub fn key_id(&self) -> Result<String> {
        Ok(hash::sha256_hex(&canonical::encode(self)?))
    }
}

// ── Root ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Root {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub spec_version: String,
    pub consistent_snapshot: bool,
    pub version: u64,
    #[serde(with = "tuf_date")]
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, PublicKey>,
    pub roles: BTreeMap<RoleType, RoleKeys>,
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn declared_type(&self) -> RoleType {
        self.role_type
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// ── Timestamp / Snapshot ────────────────────────────────────────────────────

/// Version, length and hashes of a pinned metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaFile {
    pub version: u64,
    pub length: u64,
    pub hashes: Hashes,
}

impl MetaFile {
    /// Describe the exact bytes of a published metadata file.
    pub fn describe(version: u64, bytes: &[u8]) -> Self {
        MetaFile {
            version,
            length: bytes.len() as u64,
            hashes: hash::hash_set(bytes),
        }
    }

    /// True when this (trusted) description is the file `pinned` points at:
    /// same version, same length, and every pinned hash agrees.
    pub fn satisfies(&self, pinned: &MetaFile) -> bool {
        self.version == pinned.version
            && self.length == pinned.length
            && !pinned.hashes.is_empty()
            && hash::compare_hashes("pin", &pinned.hashes, &self.hashes).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timestamp {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub spec_version: String,
    pub version: u64,
    #[serde(with = "tuf_date")]
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
}

impl Timestamp {
    pub fn new(
        spec_version: &str,
        version: u64,
        expires: DateTime<Utc>,
        snapshot: MetaFile,
    ) -> Self {
        Timestamp {
            role_type: RoleType::Timestamp,
            spec_version: spec_version.to_string(),
            version,
            expires,
            meta: BTreeMap::from([(SNAPSHOT_META.to_string(), snapshot)]),
        }
    }

    pub fn snapshot_meta(&self) -> Result<&MetaFile> {
        self.meta.get(SNAPSHOT_META).ok_or_else(|| Error::MissingMeta {
            role: RoleType::Timestamp,
            entry: SNAPSHOT_META.to_string(),
        })
    }
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn declared_type(&self) -> RoleType {
        self.role_type
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub spec_version: String,
    pub version: u64,
    #[serde(with = "tuf_date")]
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
}

impl Snapshot {
    pub fn new(spec_version: &str, version: u64, expires: DateTime<Utc>, targets: MetaFile) -> Self {
        Snapshot {
            role_type: RoleType::Snapshot,
            spec_version: spec_version.to_string(),
            version,
            expires,
            meta: BTreeMap::from([(TARGETS_META.to_string(), targets)]),
        }
    }

    pub fn targets_meta(&self) -> Result<&MetaFile> {
        self.meta.get(TARGETS_META).ok_or_else(|| Error::MissingMeta {
            role: RoleType::Snapshot,
            entry: TARGETS_META.to_string(),
        })
    }
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn declared_type(&self) -> RoleType {
        self.role_type
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// ── Targets ─────────────────────────────────────────────────────────────────

/// Director-only binding of a target to the ECU that should install it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetCustom {
    pub ecu_serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetFile {
    pub length: u64,
    pub hashes: Hashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<TargetCustom>,
}

impl TargetFile {
    pub fn describe(content: &[u8]) -> Self {
        TargetFile {
            length: content.len() as u64,
            hashes: hash::hash_set(content),
            custom: None,
        }
    }

    pub fn bound_to(mut self, ecu_serial: Option<&str>) -> Self {
        self.custom = ecu_serial.map(|serial| TargetCustom {
            ecu_serial: serial.to_string(),
        });
        self
    }

    pub fn ecu_serial(&self) -> Option<&str> {
        self.custom.as_ref().map(|c| c.ecu_serial.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Targets {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub spec_version: String,
    pub version: u64,
    #[serde(with = "tuf_date")]
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, TargetFile>,
}

impl Targets {
    pub fn new(
        spec_version: &str,
        version: u64,
        expires: DateTime<Utc>,
        targets: BTreeMap<String, TargetFile>,
    ) -> Self {
        Targets {
            role_type: RoleType::Targets,
            spec_version: spec_version.to_string(),
            version,
            expires,
            targets,
        }
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn declared_type(&self) -> RoleType {
        self.role_type
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// ── Manifests ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstalledImage {
    pub filename: String,
    pub length: u64,
    pub hashes: Hashes,
}

impl InstalledImage {
    pub fn describe(filename: &str, content: &[u8]) -> Self {
        InstalledImage {
            filename: filename.to_string(),
            length: content.len() as u64,
            hashes: hash::hash_set(content),
        }
    }

    /// True when `target` describes the same content as this image.
    pub fn matches(&self, path: &str, target: &TargetFile) -> bool {
        self.filename == path
            && self.length == target.length
            && hash::compare_hashes(path, &target.hashes, &self.hashes).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcuVersionReport {
    pub ecu_serial: String,
    #[serde(with = "tuf_date")]
    pub time: DateTime<Utc>,
    pub nonce: String,
    /// Empty when no attack was detected.
    pub attacks_detected: String,
    pub installed_image: InstalledImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleManifest {
    pub vin: String,
    pub primary_ecu_serial: String,
    pub ecu_version_reports: BTreeMap<String, Signed<EcuVersionReport>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn sample_targets() -> Signed<Targets> {
        let mut entries = BTreeMap::new();
        entries.insert("a.txt".to_string(), TargetFile::describe(b"hi"));
        Signed {
            signed: Targets::new("1.0.0", 1, fixed_time(), entries),
            signatures: vec![],
        }
    }

    #[test]
    fn expires_serializes_at_second_precision() {
        let json = serde_json::to_string(&sample_targets()).unwrap();
        assert!(json.contains(r#""expires":"2030-01-01T00:00:00Z""#));
    }

    #[test]
    fn versioned_file_names() {
        assert_eq!(RoleType::Snapshot.versioned_file(3), "3.snapshot.json");
        assert_eq!(RoleType::Root.versioned_file(1), "1.root.json");
    }

    #[test]
    fn parse_rejects_wrong_role_type() {
        // Snapshot and Timestamp share a shape; only `_type` tells them apart.
        let snapshot = Signed {
            signed: Snapshot::new("1.0.0", 1, fixed_time(), MetaFile::describe(1, b"t")),
            signatures: vec![],
        };
        let bytes = snapshot.to_canonical_bytes().unwrap();
        let err = Signed::<Timestamp>::from_slice("timestamp.json", &bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongRoleType {
                expected: RoleType::Timestamp,
                actual: RoleType::Snapshot
            }
        ));
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let mut value = serde_json::to_value(sample_targets()).unwrap();
        value["signed"]["delegations"] = serde_json::json!({});
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = Signed::<Targets>::from_slice("1.targets.json", &bytes).unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let mut value = serde_json::to_value(sample_targets()).unwrap();
        value["signed"].as_object_mut().unwrap().remove("version");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Signed::<Targets>::from_slice("1.targets.json", &bytes).is_err());
    }

    #[test]
    fn canonical_round_trip_is_stable() {
        let original = sample_targets();
        let bytes = original.to_canonical_bytes().unwrap();
        let parsed = Signed::<Targets>::from_slice("1.targets.json", &bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.to_canonical_bytes().unwrap(), bytes);
    }

    #[test]
    fn meta_file_satisfies_exact_pin_only() {
        let pinned = MetaFile::describe(2, b"snapshot-bytes");
        assert!(MetaFile::describe(2, b"snapshot-bytes").satisfies(&pinned));
        assert!(!MetaFile::describe(3, b"snapshot-bytes").satisfies(&pinned));
        assert!(!MetaFile::describe(2, b"snapshot-byteZ").satisfies(&pinned));
    }

    #[test]
    fn key_id_is_derived_from_key_material() {
        let a = PublicKey::ed25519("aa".repeat(32));
        let b = PublicKey::ed25519("bb".repeat(32));
        assert_eq!(a.key_id().unwrap(), a.clone().key_id().unwrap());
        assert_ne!(a.key_id().unwrap(), b.key_id().unwrap());
    }

    #[test]
    fn key_hex_has_one_spelling() {
        let lower = PublicKey::ed25519("ab".repeat(32));
        assert_eq!(PublicKey::ed25519("AB".repeat(32)), lower);

        let json = serde_json::to_string(&lower).unwrap();
        assert!(serde_json::from_str::<PublicKey>(&json).is_ok());
        let shouted = json.replace(&"ab".repeat(32), &"AB".repeat(32));
        assert!(serde_json::from_str::<PublicKey>(&shouted).is_err());
        let short = json.replace(&"ab".repeat(32), &"ab".repeat(31));
        assert!(serde_json::from_str::<PublicKey>(&short).is_err());
    }

    #[test]
    fn target_binding_round_trips() {
        let target = TargetFile::describe(b"fw").bound_to(Some("ECU1"));
        let json = serde_json::to_string(&target).unwrap();
        assert!(json.contains(r#""custom":{"ecu_serial":"ECU1"}"#));
        let parsed: TargetFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ecu_serial(), Some("ECU1"));
    }
}
