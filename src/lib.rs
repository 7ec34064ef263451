// lib.rs — Uptane/TUF metadata trust-chain engine
//
// Two repositories (Image and Director) publish signed, versioned
// Root/Timestamp/Snapshot/Targets metadata; the client walks both chains from
// pinned roots, cross-validates the Director's instructions against the Image
// repository and only then authorizes downloads.

pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod repo;
pub mod sign;
pub mod timeserver;
pub mod tuf;

pub use error::{Error, FetchError, Result};
