// manifest.rs — ECU version reports and vehicle manifests
//
// Device side: each ECU signs a report of what it has installed, and the
// primary ECU signs the aggregate. Director side: `ManifestVerifier` checks a
// received manifest against the device's registered ECU keys and the nonces
// it has already seen, decides which ECUs still need their assignment, and
// `ManifestLog` keeps every accepted manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sign::{self, KeyPair};
use crate::tuf::canonical;
use crate::tuf::model::{
    EcuVersionReport, InstalledImage, PublicKey, Signed, Targets, VehicleManifest,
};

/// A nonce unique to one update cycle.
pub fn generate_nonce() -> String {
    Uuid::new_v4().to_string()
}

/// Sign the report `ecu_key`'s ECU sends for this cycle. `attacks_detected`
/// is empty when nothing was detected.
pub fn build_ecu_report(
    ecu_serial: &str,
    ecu_key: &KeyPair,
    installed_image: InstalledImage,
    nonce: &str,
    attacks_detected: &str,
    time: DateTime<Utc>,
) -> Result<Signed<EcuVersionReport>> {
    let report = EcuVersionReport {
        ecu_serial: ecu_serial.to_string(),
        time: time.trunc_subsecs(0),
        nonce: nonce.to_string(),
        attacks_detected: attacks_detected.to_string(),
        installed_image,
    };
    sign::sign_payload(report, std::slice::from_ref(ecu_key))
}

/// Embed every ECU report and sign the whole with the primary key.
pub fn build_vehicle_manifest(
    vin: &str,
    primary_ecu_serial: &str,
    primary_key: &KeyPair,
    reports: Vec<Signed<EcuVersionReport>>,
) -> Result<Signed<VehicleManifest>> {
    let mut ecu_version_reports = BTreeMap::new();
    for report in reports {
        let serial = report.signed.ecu_serial.clone();
        if ecu_version_reports.insert(serial.clone(), report).is_some() {
            return Err(Error::ManifestRejected(format!(
                "two reports for ECU {serial}"
            )));
        }
    }
    let manifest = VehicleManifest {
        vin: vin.to_string(),
        primary_ecu_serial: primary_ecu_serial.to_string(),
        ecu_version_reports,
    };
    sign::sign_payload(manifest, std::slice::from_ref(primary_key))
}

fn check_signature<T: serde::Serialize>(what: &str, signed: &Signed<T>, key: &PublicKey) -> Result<()> {
    let bytes = canonical::encode(&signed.signed)?;
    let authorized = BTreeMap::from([(key.key_id()?, key.clone())]);
    sign::verify_threshold(what, &bytes, &signed.signatures, &authorized, 1)
        .map(|_| ())
        .map_err(|e| Error::ManifestRejected(e.to_string()))
}

/// Director-side checks for the manifests of one device.
#[derive(Debug, Clone)]
pub struct ManifestVerifier {
    vin: String,
    primary_ecu_serial: String,
    ecu_keys: BTreeMap<String, PublicKey>,
    seen_nonces: BTreeMap<String, BTreeSet<String>>,
}

impl ManifestVerifier {
    /// `ecu_keys` must include the primary ECU.
    pub fn new(
        vin: &str,
        primary_ecu_serial: &str,
        ecu_keys: BTreeMap<String, PublicKey>,
    ) -> Result<Self> {
        if !ecu_keys.contains_key(primary_ecu_serial) {
            return Err(Error::Config(format!(
                "primary ECU {primary_ecu_serial} has no registered key"
            )));
        }
        Ok(ManifestVerifier {
            vin: vin.to_string(),
            primary_ecu_serial: primary_ecu_serial.to_string(),
            ecu_keys,
            seen_nonces: BTreeMap::new(),
        })
    }

    /// Accept or reject `manifest`. Nonces are recorded only on acceptance.
    pub fn verify(&mut self, manifest: &Signed<VehicleManifest>) -> Result<()> {
        let result = self.check(manifest);
        match &result {
            Ok(()) => {
                for (serial, report) in &manifest.signed.ecu_version_reports {
                    self.seen_nonces
                        .entry(serial.clone())
                        .or_default()
                        .insert(report.signed.nonce.clone());
                }
                info!(vin = %self.vin, "accepted vehicle manifest");
            }
            Err(error) => warn!(vin = %self.vin, %error, "rejected vehicle manifest"),
        }
        result
    }

    /// ECUs of this device whose Director assignment in `director_targets`
    /// is not what their report says is installed. An assigned ECU with no
    /// report counts as pending.
    pub fn pending_ecus(
        &self,
        manifest: &VehicleManifest,
        director_targets: &Targets,
    ) -> BTreeSet<String> {
        let mut pending = BTreeSet::new();
        for (path, target) in &director_targets.targets {
            let Some(serial) = target.ecu_serial() else {
                continue;
            };
            if !self.ecu_keys.contains_key(serial) {
                continue;
            }
            let installed = manifest
                .ecu_version_reports
                .get(serial)
                .map(|report| &report.signed.installed_image);
            if !installed.is_some_and(|image| image.matches(path, target)) {
                pending.insert(serial.to_string());
            }
        }
        pending
    }

    fn check(&self, manifest: &Signed<VehicleManifest>) -> Result<()> {
        let reject = |reason: String| Err(Error::ManifestRejected(reason));
        let body = &manifest.signed;
        if body.vin != self.vin {
            return reject(format!("manifest for {} sent to {}", body.vin, self.vin));
        }
        if body.primary_ecu_serial != self.primary_ecu_serial {
            return reject(format!("unexpected primary ECU {}", body.primary_ecu_serial));
        }
        let Some(primary_key) = self.ecu_keys.get(&self.primary_ecu_serial) else {
            return reject(format!("primary ECU {} has no registered key", self.primary_ecu_serial));
        };
        check_signature("vehicle manifest", manifest, primary_key)?;
        if !body.ecu_version_reports.contains_key(&self.primary_ecu_serial) {
            return reject("primary ECU report missing".into());
        }
        for serial in self.ecu_keys.keys() {
            if !body.ecu_version_reports.contains_key(serial) {
                return reject(format!("no report from registered ECU {serial}"));
            }
        }
        for (serial, report) in &body.ecu_version_reports {
            let Some(key) = self.ecu_keys.get(serial) else {
                return reject(format!("report from unregistered ECU {serial}"));
            };
            if &report.signed.ecu_serial != serial {
                return reject(format!(
                    "report filed under {serial} names ECU {}",
                    report.signed.ecu_serial
                ));
            }
            check_signature(serial, report, key)?;
            if self
                .seen_nonces
                .get(serial)
                .is_some_and(|seen| seen.contains(&report.signed.nonce))
            {
                return reject(format!("ECU {serial} replayed nonce {}", report.signed.nonce));
            }
            if !report.signed.attacks_detected.is_empty() {
                return reject(format!(
                    "ECU {serial} reports attack: {}",
                    report.signed.attacks_detected
                ));
            }
        }
        Ok(())
    }
}

/// Append-only store of accepted manifests: `<dir>/<vin>/<n>.manifest.json`.
#[derive(Debug, Clone)]
pub struct ManifestLog {
    dir: PathBuf,
}

impl ManifestLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ManifestLog { dir: dir.into() }
    }

    fn device_dir(&self, vin: &str) -> Result<PathBuf> {
        crate::repo::store::resolve_target_path(&self.dir, vin)
            .map_err(|_| Error::ManifestRejected(format!("unusable VIN '{vin}'")))
    }

    /// Highest sequence number stored for `vin`, 0 when none.
    pub fn latest(&self, vin: &str) -> Result<u64> {
        let dir = self.device_dir(vin)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(dir, e)),
        };
        let mut latest = 0;
        for entry in entries {
            let name = entry.map_err(|e| Error::io(&dir, e))?.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".manifest.json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                latest = latest.max(n);
            }
        }
        Ok(latest)
    }

    /// Store `manifest` under the next sequence number. Existing entries are
    /// never overwritten.
    pub fn append(&self, manifest: &Signed<VehicleManifest>) -> Result<(u64, PathBuf)> {
        let vin = &manifest.signed.vin;
        let dir = self.device_dir(vin)?;
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let bytes = canonical::encode(manifest)?;
        let sequence = self.latest(vin)? + 1;
        let path = dir.join(format!("{sequence}.manifest.json"));
        let mut file = NamedTempFile::new_in(&dir).map_err(|e| Error::io(&dir, e))?;
        file.write_all(&bytes).map_err(|e| Error::io(file.path(), e))?;
        file.persist_noclobber(&path)
            .map_err(|e| Error::io(&path, e.error))?;
        Ok((sequence, path))
    }

    pub fn read(&self, vin: &str, sequence: u64) -> Result<Signed<VehicleManifest>> {
        let path = self.device_dir(vin)?.join(format!("{sequence}.manifest.json"));
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::json(path.display().to_string(), e))
    }
}

/// Load a manifest written by the device, e.g. from a request body on disk.
pub fn load_manifest(path: &Path) -> Result<Signed<VehicleManifest>> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuf::model::TargetFile;

    struct Device {
        primary: KeyPair,
        secondary: KeyPair,
    }

    impl Device {
        fn new() -> Self {
            Device {
                primary: KeyPair::generate(),
                secondary: KeyPair::generate(),
            }
        }

        fn verifier(&self) -> ManifestVerifier {
            let keys = BTreeMap::from([
                ("PRIMARY".to_string(), self.primary.public_key()),
                ("ECU2".to_string(), self.secondary.public_key()),
            ]);
            ManifestVerifier::new("VIN123", "PRIMARY", keys).unwrap()
        }

        fn manifest(&self, nonce: &str, attack: &str) -> Signed<VehicleManifest> {
            let image = InstalledImage::describe("fw/v1.bin", b"v1");
            let reports = vec![
                build_ecu_report("PRIMARY", &self.primary, image.clone(), nonce, "", Utc::now())
                    .unwrap(),
                build_ecu_report("ECU2", &self.secondary, image, nonce, attack, Utc::now())
                    .unwrap(),
            ];
            build_vehicle_manifest("VIN123", "PRIMARY", &self.primary, reports).unwrap()
        }
    }

    #[test]
    fn accepts_fresh_manifest_once() {
        let device = Device::new();
        let mut verifier = device.verifier();
        let manifest = device.manifest(&generate_nonce(), "");
        verifier.verify(&manifest).unwrap();
        // same nonces again: replay
        assert!(matches!(
            verifier.verify(&manifest).unwrap_err(),
            Error::ManifestRejected(_)
        ));
        verifier.verify(&device.manifest(&generate_nonce(), "")).unwrap();
    }

    #[test]
    fn rejected_manifest_does_not_burn_nonce() {
        let device = Device::new();
        let mut verifier = device.verifier();
        let nonce = generate_nonce();
        assert!(verifier.verify(&device.manifest(&nonce, "rollback attempt")).is_err());
        verifier.verify(&device.manifest(&nonce, "")).unwrap();
    }

    #[test]
    fn rejects_foreign_ecu_signature() {
        let device = Device::new();
        let mut verifier = device.verifier();
        let mut manifest = device.manifest(&generate_nonce(), "");
        let forged = build_ecu_report(
            "ECU2",
            &KeyPair::generate(),
            InstalledImage::describe("fw/evil.bin", b"evil"),
            &generate_nonce(),
            "",
            Utc::now(),
        )
        .unwrap();
        manifest.signed.ecu_version_reports.insert("ECU2".into(), forged);
        // re-sign the outer manifest so only the inner report is wrong
        let manifest = sign::sign_payload(manifest.signed, std::slice::from_ref(&device.primary))
            .unwrap();
        assert!(verifier.verify(&manifest).is_err());
    }

    #[test]
    fn rejects_missing_unknown_and_misaddressed() {
        let device = Device::new();
        let mut verifier = device.verifier();

        let mut missing = device.manifest(&generate_nonce(), "").signed;
        missing.ecu_version_reports.remove("ECU2");
        let missing = sign::sign_payload(missing, std::slice::from_ref(&device.primary)).unwrap();
        assert!(verifier.verify(&missing).is_err());

        let mut wrong_vin = device.manifest(&generate_nonce(), "").signed;
        wrong_vin.vin = "OTHER".into();
        let wrong_vin = sign::sign_payload(wrong_vin, std::slice::from_ref(&device.primary)).unwrap();
        assert!(verifier.verify(&wrong_vin).is_err());

        let unsigned = Signed {
            signed: device.manifest(&generate_nonce(), "").signed,
            signatures: vec![],
        };
        assert!(verifier.verify(&unsigned).is_err());
    }

    fn assignments(entries: &[(&str, &[u8], &str)]) -> Targets {
        let targets = entries
            .iter()
            .map(|(path, content, ecu)| {
                (path.to_string(), TargetFile::describe(content).bound_to(Some(*ecu)))
            })
            .collect();
        Targets::new("1.0.0", 1, Utc::now(), targets)
    }

    #[test]
    fn ecus_already_on_their_assignment_are_not_pending() {
        let device = Device::new();
        let verifier = device.verifier();
        let manifest = device.manifest(&generate_nonce(), "").signed;

        let current = assignments(&[("fw/v1.bin", b"v1", "PRIMARY")]);
        assert!(verifier.pending_ecus(&manifest, &current).is_empty());

        let upgrade = assignments(&[("fw/v1.bin", b"v1", "PRIMARY"), ("fw/v2.bin", b"v2", "ECU2")]);
        assert_eq!(
            verifier.pending_ecus(&manifest, &upgrade),
            BTreeSet::from(["ECU2".to_string()])
        );
    }

    #[test]
    fn same_name_with_other_content_is_pending() {
        let device = Device::new();
        let verifier = device.verifier();
        let manifest = device.manifest(&generate_nonce(), "").signed;
        let rebuilt = assignments(&[("fw/v1.bin", b"v1 rebuilt", "PRIMARY")]);
        assert_eq!(
            verifier.pending_ecus(&manifest, &rebuilt),
            BTreeSet::from(["PRIMARY".to_string()])
        );
    }

    #[test]
    fn unreported_ecu_is_pending_and_other_devices_are_not() {
        let device = Device::new();
        let verifier = device.verifier();
        let mut manifest = device.manifest(&generate_nonce(), "").signed;
        manifest.ecu_version_reports.remove("ECU2");
        let targets = assignments(&[("fw/v1.bin", b"v1", "ECU2"), ("fw/x.bin", b"x", "ECU9")]);
        assert_eq!(
            verifier.pending_ecus(&manifest, &targets),
            BTreeSet::from(["ECU2".to_string()])
        );
    }

    #[test]
    fn duplicate_reports_are_refused_at_build() {
        let key = KeyPair::generate();
        let image = InstalledImage::describe("a", b"a");
        let report = build_ecu_report("E", &key, image, "n", "", Utc::now()).unwrap();
        assert!(build_vehicle_manifest("V", "E", &key, vec![report.clone(), report]).is_err());
    }

    #[test]
    fn log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = ManifestLog::new(dir.path());
        let device = Device::new();
        assert_eq!(log.latest("VIN123").unwrap(), 0);

        let first = device.manifest(&generate_nonce(), "");
        let (n1, _) = log.append(&first).unwrap();
        let (n2, path2) = log.append(&device.manifest(&generate_nonce(), "")).unwrap();
        assert_eq!((n1, n2), (1, 2));
        assert_eq!(log.read("VIN123", 1).unwrap(), first);
        assert_eq!(load_manifest(&path2).unwrap().signed.vin, "VIN123");
    }
}
