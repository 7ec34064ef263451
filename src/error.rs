// error.rs — Error taxonomy for the trust-chain engine
//
// Trust-chain errors (root through targets) abort a whole update cycle.
// Errors raised against a single artifact (see `Error::is_artifact_scoped`)
// only reject that artifact.

use std::path::PathBuf;

use thiserror::Error;

use crate::tuf::model::RoleType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot canonicalize payload: {0}")]
    Encoding(String),

    #[error("{role} signatures below threshold: {valid} valid of {threshold} required")]
    Signature {
        role: String,
        valid: usize,
        threshold: u64,
    },

    #[error("{role} metadata version {version} expired at {expires}")]
    ExpiredMetadata {
        role: RoleType,
        version: u64,
        expires: String,
    },

    #[error("{role} rollback rejected: trusted version {trusted}, received {received}")]
    Rollback {
        role: RoleType,
        trusted: u64,
        received: u64,
    },

    #[error("{what} {algorithm} hash mismatch: expected {expected}, actual {actual}")]
    HashMismatch {
        what: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("{what} length mismatch: expected {expected}, actual {actual}")]
    LengthMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("{role} version mismatch: pinned {expected}, file declares {actual}")]
    VersionMismatch {
        role: RoleType,
        expected: u64,
        actual: u64,
    },

    #[error("target '{path}' not corroborated by the image repository: {reason}")]
    CrossRepositoryMismatch { path: String, reason: String },

    #[error("invalid root metadata: {0}")]
    InvalidRoot(String),

    #[error("{role} references unknown or invalid key {key_id}")]
    UnknownRoleKey { role: String, key_id: String },

    #[error("expected {expected} metadata, found {actual}")]
    WrongRoleType { expected: RoleType, actual: RoleType },

    #[error("{role} metadata is missing meta entry '{entry}'")]
    MissingMeta { role: RoleType, entry: String },

    #[error("{what} carries no supported hash (sha256 or sha512)")]
    UnsupportedHashAlgorithm { what: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid target path '{0}'")]
    InvalidTargetPath(String),

    #[error("fetching {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: FetchError,
    },

    #[error("parsing {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("time attestation rejected: {0}")]
    TimeAttestation(String),

    #[error("vehicle manifest rejected: {0}")]
    ManifestRejected(String),

    #[error("{0} is not initialized")]
    NotInitialized(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Transport failures reported by a `Remote`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found")]
    NotFound,

    #[error("exceeds maximum length of {max} bytes")]
    TooLarge { max: u64 },

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            what: what.into(),
            source,
        }
    }

    /// True for the errors that only ever invalidate one artifact. A missing
    /// or oversized artifact file, or one described only by hashes we cannot
    /// compute, is the artifact's problem; a failing transport is not.
    pub fn is_artifact_scoped(&self) -> bool {
        matches!(
            self,
            Error::CrossRepositoryMismatch { .. }
                | Error::HashMismatch { .. }
                | Error::LengthMismatch { .. }
                | Error::InvalidTargetPath(_)
                | Error::UnsupportedHashAlgorithm { .. }
                | Error::Fetch {
                    source: FetchError::NotFound | FetchError::TooLarge { .. },
                    ..
                }
        )
    }
}
