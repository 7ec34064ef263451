// sign.rs — Ed25519 keys, signatures and threshold verification
//
// Signatures always cover the canonical encoding of a payload. Key ids are
// self-describing (SHA-256 over the canonical public key object), so a key
// cannot be registered under an alias of the attacker's choosing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::tuf::canonical;
use crate::tuf::model::{PublicKey, RoleType, Signature, Signed};

/// Environment variable naming the directory that holds role key files.
pub const KEYS_DIR_ENV: &str = "UPTANE_KEYS_DIR";

const SECRET_KEY_EXT: &str = "sk";
const PUBLIC_KEY_EXT: &str = "pk";

// ── Key pairs ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        KeyPair {
            signing: SigningKey::generate(&mut csprng),
        }
    }

    /// Restore a key pair from a base64-encoded 32-byte seed.
    pub fn from_base64(secret_key_b64: &str) -> Result<Self> {
        let sk_bytes = Zeroizing::new(
            B64.decode(secret_key_b64.trim())
                .map_err(|e| Error::InvalidKey(format!("decoding secret key base64: {e}")))?,
        );
        let sk_array: [u8; 32] = sk_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKey("secret key must be 32 bytes".into()))?;
        let sk_array = Zeroizing::new(sk_array);
        Ok(KeyPair {
            signing: SigningKey::from_bytes(&sk_array),
        })
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(self.signing.to_bytes()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = Zeroizing::new(fs::read_to_string(path).map_err(|e| Error::io(path, e))?);
        KeyPair::from_base64(&contents)
    }

    /// Write `<dir>/<name>.sk` (secret, owner-only) and `<dir>/<name>.pk`
    /// (canonical public key object).
    pub fn save(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let sk_path = dir.join(format!("{name}.{SECRET_KEY_EXT}"));
        write_secret(&sk_path, self.to_base64().as_bytes())?;
        let pk_path = dir.join(format!("{name}.{PUBLIC_KEY_EXT}"));
        let public = canonical::encode(&self.public_key())?;
        fs::write(&pk_path, public).map_err(|e| Error::io(&pk_path, e))?;
        Ok(sk_path)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::ed25519(hex::encode(self.signing.verifying_key().to_bytes()))
    }

    pub fn key_id(&self) -> Result<String> {
        self.public_key().key_id()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key().keyval.public)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(contents).map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::io(path, e))
}

/// Read a public key object written by [`KeyPair::save`].
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(path.display().to_string(), e))
}

// ── Signing ─────────────────────────────────────────────────────────────────

/// Sign already-canonical bytes.
pub fn sign_bytes(data: &[u8], key: &KeyPair) -> Result<Signature> {
    Ok(Signature {
        keyid: key.key_id()?,
        sig: hex::encode(key.signing.sign(data).to_bytes()),
    })
}

/// Wrap `payload` in an envelope signed by every key in `keys`.
pub fn sign_payload<T: Serialize>(payload: T, keys: &[KeyPair]) -> Result<Signed<T>> {
    let bytes = canonical::encode(&payload)?;
    let signatures = keys
        .iter()
        .map(|key| sign_bytes(&bytes, key))
        .collect::<Result<Vec<_>>>()?;
    Ok(Signed {
        signed: payload,
        signatures,
    })
}

// ── Verification ────────────────────────────────────────────────────────────

fn verifying_key(key: &PublicKey) -> Result<VerifyingKey> {
    let pk_bytes = hex::decode(&key.keyval.public)
        .map_err(|e| Error::InvalidKey(format!("decoding public key hex: {e}")))?;
    let pk_array: [u8; 32] = pk_bytes
        .try_into()
        .map_err(|_| Error::InvalidKey("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&pk_array)
        .map_err(|e| Error::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}

/// Decoded Ed25519 key bytes, whatever spelling the key object carries.
pub(crate) fn key_material(key: &PublicKey) -> Result<[u8; 32]> {
    Ok(verifying_key(key)?.to_bytes())
}

/// Check one hex signature. A malformed signature is simply invalid; a
/// malformed key is an error.
pub fn verify_signature(key: &PublicKey, data: &[u8], signature_hex: &str) -> Result<bool> {
    let verifying_key = verifying_key(key)?;
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return Ok(false);
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return Ok(false);
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// Count distinct authorized key ids with a valid signature over `data` and
/// require at least `threshold` of them. Signatures from unlisted keys are
/// ignored; repeated signatures from one key id count once.
pub fn verify_threshold(
    role: &str,
    data: &[u8],
    signatures: &[Signature],
    authorized: &BTreeMap<String, PublicKey>,
    threshold: u64,
) -> Result<usize> {
    // Counted by key bytes, not by id: two ids naming one key are one signer.
    let mut valid: BTreeSet<[u8; 32]> = BTreeSet::new();
    for signature in signatures {
        let Some(key) = authorized.get(&signature.keyid) else {
            debug!(role, keyid = %signature.keyid, "ignoring signature from unauthorized key");
            continue;
        };
        let material = key_material(key)?;
        if valid.contains(&material) {
            continue;
        }
        if verify_signature(key, data, &signature.sig)? {
            valid.insert(material);
        }
    }
    if threshold == 0 || (valid.len() as u64) < threshold {
        return Err(Error::Signature {
            role: role.to_string(),
            valid: valid.len(),
            threshold,
        });
    }
    Ok(valid.len())
}

// ── KeyStore ────────────────────────────────────────────────────────────────

/// Signing keys per role, owned by one repository instance.
///
/// On disk each key is `<role>-<n>.sk` (base64 seed) next to a `.pk` public
/// key object.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    roles: BTreeMap<RoleType, Vec<KeyPair>>,
}

impl KeyStore {
    /// Fresh keys, `per_role` for each of the four roles.
    pub fn generate(per_role: usize) -> Self {
        let mut store = KeyStore::default();
        for role in RoleType::ALL {
            store.set(role, (0..per_role).map(|_| KeyPair::generate()).collect());
        }
        store
    }

    pub fn set(&mut self, role: RoleType, keys: Vec<KeyPair>) {
        self.roles.insert(role, keys);
    }

    pub fn keys(&self, role: RoleType) -> &[KeyPair] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SECRET_KEY_EXT) {
                files.push(path);
            }
        }
        files.sort();

        let mut store = KeyStore::default();
        for path in files {
            let Some(role) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| stem.split('-').next())
                .and_then(role_from_str)
            else {
                continue;
            };
            store.roles.entry(role).or_default().push(KeyPair::load(&path)?);
        }
        if store.roles.is_empty() {
            return Err(Error::NotInitialized(format!(
                "key directory {}",
                dir.display()
            )));
        }
        Ok(store)
    }

    pub fn save_dir(&self, dir: &Path) -> Result<()> {
        for (role, keys) in &self.roles {
            for (index, key) in keys.iter().enumerate() {
                key.save(dir, &format!("{role}-{index}"))?;
            }
        }
        Ok(())
    }
}

fn role_from_str(name: &str) -> Option<RoleType> {
    RoleType::ALL.into_iter().find(|role| role.as_str() == name)
}

/// Resolve the key directory from an explicit path or `UPTANE_KEYS_DIR`.
pub fn keys_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match std::env::var(KEYS_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => Err(Error::Config(format!(
            "no key directory found. Set {KEYS_DIR_ENV} or pass --keys <dir>"
        ))),
    }
}
