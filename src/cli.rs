// cli.rs — Command-line interface definitions (clap derive)
//
// Defines the top-level `uptane` command:
//   uptane keygen            — generate a single Ed25519 keypair (ECU, time server)
//   uptane repo ...          — initialize and publish an Image or Director repository
//   uptane client ...        — pin roots and run update cycles from local repositories
//   uptane manifest build    — sign a vehicle manifest from the client's installed state

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "uptane")]
#[command(about = "Uptane/TUF metadata trust-chain engine")]
#[command(version)]
pub struct Cli {
    /// Engine configuration (JSON); defaults apply when absent
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless UPTANE_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an Ed25519 keypair (<name>.sk / <name>.pk)
    Keygen {
        /// Output directory for key files (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base name of the key files
        #[arg(long, default_value = "uptane")]
        name: String,
    },

    /// Repository administration
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Client-side trust and updates
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },

    /// Vehicle manifests
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
}

/// Options shared by every repository command.
#[derive(Args)]
pub struct RepoTarget {
    /// Repository directory
    #[arg(long)]
    pub dir: PathBuf,

    /// Role key directory (default: $UPTANE_KEYS_DIR)
    #[arg(long)]
    pub keys: Option<PathBuf>,

    /// Treat the repository as the Director (default: Image)
    #[arg(long)]
    pub director: bool,
}

#[derive(Subcommand)]
pub enum RepoAction {
    /// Create 1.root.json, generating role keys if the key directory is empty
    Init {
        #[command(flatten)]
        repo: RepoTarget,
    },

    /// Store a file and publish new targets/snapshot/timestamp
    Publish {
        #[command(flatten)]
        repo: RepoTarget,

        /// Logical target path, e.g. fw/v2.bin
        #[arg(long)]
        path: String,

        /// File to publish
        #[arg(long)]
        file: PathBuf,

        /// Bind the target to one ECU serial
        #[arg(long)]
        ecu: Option<String>,
    },

    /// Director: assign an image already in the Image repository to an ECU
    Assign {
        #[command(flatten)]
        repo: RepoTarget,

        /// Image repository directory holding the target
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        path: String,

        #[arg(long)]
        ecu: String,
    },

    /// Publish new metadata without a target
    Remove {
        #[command(flatten)]
        repo: RepoTarget,

        #[arg(long)]
        path: String,
    },

    /// Re-issue only the timestamp
    ResignTimestamp {
        #[command(flatten)]
        repo: RepoTarget,
    },

    /// Re-issue every role expiring within the resign window
    Resign {
        #[command(flatten)]
        repo: RepoTarget,
    },

    /// Replace all role keys with the ones in --new-keys (generated if empty)
    RotateRoot {
        #[command(flatten)]
        repo: RepoTarget,

        #[arg(long)]
        new_keys: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// Pin the Director and Image roots
    Init {
        /// Client state directory
        #[arg(long)]
        dir: PathBuf,

        /// Director root obtained out of band (e.g. 1.root.json)
        #[arg(long)]
        director_root: PathBuf,

        /// Image root obtained out of band
        #[arg(long)]
        image_root: PathBuf,
    },

    /// Run one update cycle
    Update {
        #[arg(long)]
        dir: PathBuf,

        /// Director repository directory
        #[arg(long)]
        director: PathBuf,

        /// Image repository directory
        #[arg(long)]
        image: PathBuf,

        /// ECU serials of this device (repeatable)
        #[arg(long = "ecu", required = true)]
        ecus: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ManifestAction {
    /// Sign ECU reports and the vehicle manifest from the client's installed state
    Build {
        /// Client state directory
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        vin: String,

        /// Primary ECU serial
        #[arg(long)]
        primary: String,

        /// Directory holding <serial>.sk for every ECU
        #[arg(long)]
        ecu_keys: PathBuf,

        /// ECU serials to report (repeatable)
        #[arg(long = "ecu", required = true)]
        ecus: Vec<String>,

        /// Where to write the manifest (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
