// remote.rs — Transport seam for the updater
//
// The core only needs "fetch bytes by logical name, bounded by a length".
// Retries, timeouts and HTTP belong to implementations of `Remote`.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;

use crate::error::FetchError;
use crate::repo::store::resolve_target_path;

pub trait Remote {
    /// Fetch `name` (`timestamp.json`, `<n>.<role>.json` or
    /// `targets/<path>`), failing with `TooLarge` past `max_length` bytes.
    fn fetch(&self, name: &str, max_length: u64) -> Result<Vec<u8>, FetchError>;
}

impl<R: Remote + ?Sized> Remote for &R {
    fn fetch(&self, name: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(name, max_length)
    }
}

/// Reads a repository directory written by `repo::Repository`.
#[derive(Debug, Clone)]
pub struct FsRemote {
    base: PathBuf,
}

impl FsRemote {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FsRemote { base: base.into() }
    }
}

impl Remote for FsRemote {
    fn fetch(&self, name: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        let path = resolve_target_path(&self.base, name).map_err(|_| FetchError::NotFound)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(FetchError::NotFound),
            Err(e) => return Err(e.into()),
        };
        // Read one byte past the limit so an oversized file is detected
        // without trusting its reported size.
        let mut bytes = Vec::new();
        file.take(max_length.saturating_add(1)).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > max_length {
            return Err(FetchError::TooLarge { max: max_length });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_reads_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("timestamp.json"), b"0123456789").unwrap();
        let remote = FsRemote::new(dir.path());
        assert_eq!(remote.fetch("timestamp.json", 10).unwrap(), b"0123456789");
        assert!(matches!(
            remote.fetch("timestamp.json", 9),
            Err(FetchError::TooLarge { max: 9 })
        ));
    }

    #[test]
    fn missing_and_escaping_names_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let remote = FsRemote::new(dir.path());
        assert!(matches!(remote.fetch("2.root.json", 100), Err(FetchError::NotFound)));
        assert!(matches!(remote.fetch("../secret", 100), Err(FetchError::NotFound)));
    }
}
