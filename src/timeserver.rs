// timeserver.rs — Signed time attestations
//
// A client that cannot trust its own clock asks a time server to sign the
// current time together with a fresh nonce. The attestation is accepted only
// if it is signed by the pinned server key, echoes the outstanding nonce and
// does not move time backwards. Retry policy for a failed fetch is the
// caller's.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sign::{self, KeyPair};
use crate::tuf::canonical;
use crate::tuf::model::{tuf_date, PublicKey, Signed};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeAttestation {
    pub nonces: Vec<String>,
    #[serde(with = "tuf_date")]
    pub time: DateTime<Utc>,
}

/// Server side: signs the time for a batch of nonces.
pub struct TimeServer {
    key: KeyPair,
}

impl TimeServer {
    pub fn new(key: KeyPair) -> Self {
        TimeServer { key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn attest(&self, nonces: Vec<String>, now: DateTime<Utc>) -> Result<Signed<TimeAttestation>> {
        let attestation = TimeAttestation {
            nonces,
            time: now.trunc_subsecs(0),
        };
        sign::sign_payload(attestation, std::slice::from_ref(&self.key))
    }
}

/// Client side: the last time a valid attestation vouched for.
#[derive(Debug, Clone)]
pub struct TrustedClock {
    server_keys: BTreeMap<String, PublicKey>,
    pending_nonce: Option<String>,
    last: Option<DateTime<Utc>>,
}

impl TrustedClock {
    pub fn new(server_key: PublicKey) -> Result<Self> {
        let key_id = server_key.key_id()?;
        Ok(TrustedClock {
            server_keys: BTreeMap::from([(key_id, server_key)]),
            pending_nonce: None,
            last: None,
        })
    }

    /// A fresh nonce for the next attestation request. Any earlier
    /// outstanding nonce is forgotten.
    pub fn next_nonce(&mut self) -> String {
        let nonce = Uuid::new_v4().to_string();
        self.pending_nonce = Some(nonce.clone());
        nonce
    }

    /// Verify `attestation` and advance the clock to its time.
    pub fn accept(&mut self, attestation: &Signed<TimeAttestation>) -> Result<DateTime<Utc>> {
        let Some(nonce) = self.pending_nonce.as_deref() else {
            return Err(Error::TimeAttestation("no nonce outstanding".into()));
        };
        let bytes = canonical::encode(&attestation.signed)?;
        sign::verify_threshold("timeserver", &bytes, &attestation.signatures, &self.server_keys, 1)
            .map_err(|e| Error::TimeAttestation(e.to_string()))?;
        if !attestation.signed.nonces.iter().any(|n| n == nonce) {
            return Err(Error::TimeAttestation(format!("nonce {nonce} not echoed")));
        }
        let time = attestation.signed.time;
        if let Some(last) = self.last {
            if time < last {
                return Err(Error::TimeAttestation(format!(
                    "attested time {time} precedes previously attested {last}"
                )));
            }
        }
        debug!(%time, "accepted time attestation");
        self.pending_nonce = None;
        self.last = Some(time);
        Ok(time)
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn accepts_signed_echo_and_advances() {
        let server = TimeServer::new(KeyPair::generate());
        let mut clock = TrustedClock::new(server.public_key()).unwrap();
        let nonce = clock.next_nonce();
        let now = Utc::now();
        let attested = clock
            .accept(&server.attest(vec![nonce], now).unwrap())
            .unwrap();
        assert_eq!(attested, now.trunc_subsecs(0));
        assert_eq!(clock.now(), Some(attested));
    }

    #[test]
    fn rejects_missing_nonce_echo() {
        let server = TimeServer::new(KeyPair::generate());
        let mut clock = TrustedClock::new(server.public_key()).unwrap();
        clock.next_nonce();
        let attestation = server.attest(vec!["other".into()], Utc::now()).unwrap();
        assert!(matches!(
            clock.accept(&attestation).unwrap_err(),
            Error::TimeAttestation(_)
        ));
    }

    #[test]
    fn rejects_unpinned_signer() {
        let server = TimeServer::new(KeyPair::generate());
        let impostor = TimeServer::new(KeyPair::generate());
        let mut clock = TrustedClock::new(server.public_key()).unwrap();
        let nonce = clock.next_nonce();
        let attestation = impostor.attest(vec![nonce], Utc::now()).unwrap();
        assert!(clock.accept(&attestation).is_err());
        assert_eq!(clock.now(), None);
    }

    #[test]
    fn rejects_time_going_backwards_and_replays() {
        let server = TimeServer::new(KeyPair::generate());
        let mut clock = TrustedClock::new(server.public_key()).unwrap();
        let now = Utc::now();

        let first = clock.next_nonce();
        let first_attestation = server.attest(vec![first], now).unwrap();
        clock.accept(&first_attestation).unwrap();

        // the nonce is consumed: the same attestation cannot be replayed
        assert!(clock.accept(&first_attestation).is_err());

        let second = clock.next_nonce();
        let stale = server.attest(vec![second], now - Duration::hours(1)).unwrap();
        assert!(clock.accept(&stale).is_err());
    }
}
