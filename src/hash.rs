use std::collections::BTreeMap;

use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

pub const SHA256: &str = "sha256";
pub const SHA512: &str = "sha512";

/// Hash algorithm name → lowercase hex digest.
pub type Hashes = BTreeMap<String, String>;

/// Compute SHA-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-512 hex digest of a byte slice.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// The full hash set recorded for every artifact and metadata file.
pub fn hash_set(data: &[u8]) -> Hashes {
    let mut hashes = Hashes::new();
    hashes.insert(SHA256.to_string(), sha256_hex(data));
    hashes.insert(SHA512.to_string(), sha512_hex(data));
    hashes
}

/// True if `hashes` names at least one algorithm this crate can compute.
pub fn any_supported(hashes: &Hashes) -> bool {
    hashes
        .keys()
        .any(|name| matches!(name.to_ascii_lowercase().as_str(), SHA256 | SHA512))
}

fn digest_with(algorithm: &str, data: &[u8]) -> Option<String> {
    match algorithm.to_ascii_lowercase().as_str() {
        SHA256 => Some(sha256_hex(data)),
        SHA512 => Some(sha512_hex(data)),
        _ => None,
    }
}

/// Check `data` against every hash in `expected`.
///
/// Unknown algorithms are skipped, but at least one supported algorithm must
/// be present, otherwise nothing would have been checked.
pub fn verify_hashes(what: &str, data: &[u8], expected: &Hashes) -> Result<()> {
    let mut checked = 0;
    for (algorithm, expected_hex) in expected {
        let Some(actual) = digest_with(algorithm, data) else {
            continue;
        };
        if !actual.eq_ignore_ascii_case(expected_hex) {
            return Err(Error::HashMismatch {
                what: what.to_string(),
                algorithm: algorithm.clone(),
                expected: expected_hex.clone(),
                actual,
            });
        }
        checked += 1;
    }
    if checked == 0 {
        return Err(Error::UnsupportedHashAlgorithm {
            what: what.to_string(),
        });
    }
    Ok(())
}

/// Compare two declared hash sets: every hash in `expected` must appear in
/// `actual` with the same value.
pub fn compare_hashes(what: &str, expected: &Hashes, actual: &Hashes) -> Result<()> {
    if expected.is_empty() {
        return Err(Error::UnsupportedHashAlgorithm {
            what: what.to_string(),
        });
    }
    for (algorithm, expected_hex) in expected {
        let actual_hex = actual
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(algorithm))
            .map(|(_, value)| value);
        match actual_hex {
            Some(value) if value.eq_ignore_ascii_case(expected_hex) => {}
            Some(value) => {
                return Err(Error::HashMismatch {
                    what: what.to_string(),
                    algorithm: algorithm.clone(),
                    expected: expected_hex.clone(),
                    actual: value.clone(),
                })
            }
            None => {
                return Err(Error::HashMismatch {
                    what: what.to_string(),
                    algorithm: algorithm.clone(),
                    expected: expected_hex.clone(),
                    actual: "<absent>".to_string(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"hi"),
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[test]
    fn hash_set_carries_both_algorithms() {
        let hashes = hash_set(b"payload");
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[SHA256].len(), 64);
        assert_eq!(hashes[SHA512].len(), 128);
    }

    #[test]
    fn verify_hashes_detects_tampering() {
        let hashes = hash_set(b"firmware");
        assert!(verify_hashes("fw", b"firmware", &hashes).is_ok());
        let err = verify_hashes("fw", b"firmwarE", &hashes).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
    }

    #[test]
    fn verify_hashes_requires_a_supported_algorithm() {
        let mut hashes = Hashes::new();
        hashes.insert("md5".into(), "00".into());
        let err = verify_hashes("fw", b"x", &hashes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedHashAlgorithm { .. }));
        assert!(!any_supported(&hashes));
        hashes.insert("SHA256".into(), sha256_hex(b"x"));
        assert!(any_supported(&hashes));
    }

    #[test]
    fn compare_hashes_reports_missing_algorithm() {
        let director = hash_set(b"a");
        let mut image = director.clone();
        image.remove(SHA512);
        let err = compare_hashes("a", &director, &image).unwrap_err();
        match err {
            Error::HashMismatch { algorithm, .. } => assert_eq!(algorithm, SHA512),
            other => panic!("unexpected {other:?}"),
        }
    }
}
