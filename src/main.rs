// main.rs — uptane CLI entry point
//
// A thin driver over the library: repositories and clients are plain
// directories, and the filesystem stands in for the transport.

mod cli;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

use cli::{Cli, ClientAction, Commands, ManifestAction, RepoAction, RepoTarget};
use uptane_engine::client::{self, FsRemote, Updater};
use uptane_engine::config::EngineConfig;
use uptane_engine::manifest;
use uptane_engine::repo::{RepoKind, RepoUpdateResult, Repository};
use uptane_engine::sign::{self, KeyPair, KeyStore};
use uptane_engine::tuf::canonical;
use uptane_engine::tuf::model::InstalledImage;

fn main() -> Result<()> {
    let cli = Cli::parse();
    uptane_engine::logging::init(cli.verbose);
    let config = EngineConfig::load_or_default(cli.config.as_deref())
        .context("loading engine configuration")?;

    match cli.command {
        Commands::Keygen { output, name } => cmd_keygen(output, &name),
        Commands::Repo { action } => match action {
            RepoAction::Init { repo } => cmd_repo_init(&repo, config),
            RepoAction::Publish {
                repo,
                path,
                file,
                ecu,
            } => {
                let content =
                    fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
                let versions =
                    open_repo(&repo, config)?.publish_target(&path, &content, ecu.as_deref())?;
                report_versions(&format!("published {path}"), versions);
                Ok(())
            }
            RepoAction::Assign {
                repo,
                image,
                path,
                ecu,
            } => cmd_assign(&repo, &image, &path, &ecu, config),
            RepoAction::Remove { repo, path } => {
                let versions = open_repo(&repo, config)?.remove_target(&path)?;
                report_versions(&format!("removed {path}"), versions);
                Ok(())
            }
            RepoAction::ResignTimestamp { repo } => {
                let versions = open_repo(&repo, config)?.resign_timestamp()?;
                report_versions("re-signed timestamp", versions);
                Ok(())
            }
            RepoAction::Resign { repo } => {
                let report = open_repo(&repo, config)?.resign_expiring(Utc::now())?;
                if report.reissued.is_empty() {
                    eprintln!("[uptane] nothing expires within the resign window");
                }
                for (role, version) in &report.reissued {
                    eprintln!("[uptane] re-issued {role} version {version}");
                }
                Ok(())
            }
            RepoAction::RotateRoot { repo, new_keys } => {
                let keys = load_or_generate_keys(&new_keys)?;
                let versions = open_repo(&repo, config)?.rotate_root(keys)?;
                report_versions("rotated root keys", versions);
                eprintln!(
                    "[uptane] new keys are in {}; use them for every later command",
                    new_keys.display()
                );
                Ok(())
            }
        },
        Commands::Client { action } => match action {
            ClientAction::Init {
                dir,
                director_root,
                image_root,
            } => {
                let director = fs::read(&director_root)
                    .with_context(|| format!("reading {}", director_root.display()))?;
                let image = fs::read(&image_root)
                    .with_context(|| format!("reading {}", image_root.display()))?;
                client::bootstrap(&dir, &director, &image)?;
                eprintln!("[uptane] trusted roots pinned in {}", dir.display());
                Ok(())
            }
            ClientAction::Update {
                dir,
                director,
                image,
                ecus,
            } => cmd_client_update(&dir, director, image, ecus),
        },
        Commands::Manifest { action } => match action {
            ManifestAction::Build {
                dir,
                vin,
                primary,
                ecu_keys,
                ecus,
                output,
            } => cmd_manifest_build(&dir, &vin, &primary, &ecu_keys, &ecus, output),
        },
    }
}

fn cmd_keygen(output: Option<PathBuf>, name: &str) -> Result<()> {
    let dir = output.unwrap_or_else(|| PathBuf::from("."));
    let key = KeyPair::generate();
    let sk_path = key.save(&dir, name)?;

    eprintln!("Ed25519 keypair generated:");
    eprintln!("  Secret key: {}", sk_path.display());
    eprintln!("  Public key: {}", dir.join(format!("{name}.pk")).display());
    eprintln!();
    eprintln!("Key id: {}", key.key_id()?);

    Ok(())
}

fn repo_kind(repo: &RepoTarget) -> RepoKind {
    if repo.director {
        RepoKind::Director
    } else {
        RepoKind::Image
    }
}

fn load_or_generate_keys(dir: &Path) -> Result<KeyStore> {
    let has_keys = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().extension().is_some_and(|ext| ext == "sk"))
        })
        .unwrap_or(false);
    if has_keys {
        return KeyStore::load_dir(dir)
            .with_context(|| format!("loading role keys from {}", dir.display()));
    }
    let keys = KeyStore::generate(1);
    keys.save_dir(dir)?;
    eprintln!("[uptane] generated role keys in {}", dir.display());
    Ok(keys)
}

fn cmd_repo_init(repo: &RepoTarget, config: EngineConfig) -> Result<()> {
    let keys_dir = sign::keys_dir(repo.keys.as_deref())?;
    let keys = load_or_generate_keys(&keys_dir)?;
    let kind = repo_kind(repo);
    Repository::init(&repo.dir, kind, keys, config)?;
    eprintln!(
        "[uptane] {kind} repository initialized at {}",
        repo.dir.display()
    );
    eprintln!(
        "  Pin {} on clients out of band",
        repo.dir.join("1.root.json").display()
    );
    Ok(())
}

fn open_repo(repo: &RepoTarget, config: EngineConfig) -> Result<Repository> {
    let keys_dir = sign::keys_dir(repo.keys.as_deref())?;
    let keys = KeyStore::load_dir(&keys_dir)
        .with_context(|| format!("loading role keys from {}", keys_dir.display()))?;
    Repository::open(&repo.dir, repo_kind(repo), keys, config)
        .with_context(|| format!("opening repository {}", repo.dir.display()))
}

fn cmd_assign(
    repo: &RepoTarget,
    image_dir: &Path,
    path: &str,
    ecu: &str,
    config: EngineConfig,
) -> Result<()> {
    if !repo.director {
        bail!("assign publishes to the Director repository; pass --director");
    }
    // The Image repository is only read, so it needs no signing keys.
    let image = Repository::open(image_dir, RepoKind::Image, KeyStore::default(), config.clone())
        .with_context(|| format!("opening image repository {}", image_dir.display()))?;
    let Some(info) = image.target(path)? else {
        bail!("{path} is not listed by the image repository");
    };

    let versions = open_repo(repo, config)?.publish_target_info(path, info, Some(ecu))?;
    report_versions(&format!("assigned {path} to {ecu}"), versions);
    Ok(())
}

fn cmd_client_update(
    dir: &Path,
    director: PathBuf,
    image: PathBuf,
    ecus: Vec<String>,
) -> Result<()> {
    let updater = Updater::new(dir, FsRemote::new(director), FsRemote::new(image), ecus);
    let report = updater.update()?;

    eprintln!(
        "[uptane] director: {}, image: {}",
        report.director_phase, report.image_phase
    );
    for artifact in &report.authorized {
        eprintln!(
            "  installed {} for {} ({} bytes) -> {}",
            artifact.path,
            artifact.ecu_serial,
            artifact.length,
            artifact.stored_at.display()
        );
    }
    for path in &report.already_installed {
        eprintln!("  already installed: {path}");
    }
    for path in &report.ignored {
        eprintln!("  not for this device: {path}");
    }
    for rejected in &report.rejected {
        eprintln!(
            "  REJECTED {} for {}: {}",
            rejected.path, rejected.ecu_serial, rejected.error
        );
    }
    if report.authorized.is_empty() && report.rejected.is_empty() {
        eprintln!("  no new targets");
    }
    if !report.rejected.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_manifest_build(
    dir: &Path,
    vin: &str,
    primary: &str,
    ecu_keys: &Path,
    ecus: &[String],
    output: Option<PathBuf>,
) -> Result<()> {
    let trusted = client::TrustedStore::new(dir).load()?;
    let nonce = manifest::generate_nonce();
    let now = Utc::now();

    let mut reports = Vec::new();
    for serial in ecus {
        let key_path = ecu_keys.join(format!("{serial}.sk"));
        let key = KeyPair::load(&key_path)
            .with_context(|| format!("loading ECU key {}", key_path.display()))?;
        let installed = trusted
            .installed
            .get(serial)
            .cloned()
            .unwrap_or_else(|| InstalledImage::describe("", b""));
        reports.push(manifest::build_ecu_report(serial, &key, installed, &nonce, "", now)?);
    }
    let primary_path = ecu_keys.join(format!("{primary}.sk"));
    let primary_key = KeyPair::load(&primary_path)
        .with_context(|| format!("loading primary key {}", primary_path.display()))?;
    let signed = manifest::build_vehicle_manifest(vin, primary, &primary_key, reports)?;
    let bytes = canonical::encode(&signed)?;

    match output {
        Some(path) => {
            fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("[uptane] vehicle manifest written to {}", path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

fn report_versions(what: &str, versions: RepoUpdateResult) {
    eprintln!("[uptane] {what}:");
    eprintln!(
        "  root {}, targets {}, snapshot {}, timestamp {}",
        versions.root, versions.targets, versions.snapshot, versions.timestamp
    );
}
