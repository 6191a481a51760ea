//! machsign - edit dylib dependencies of iOS apps and re-sign them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use machsign::{macho, ZSign};

#[derive(Parser, Debug)]
#[command(name = "machsign")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-sign an app bundle, IPA or Mach-O file
    Sign(SignArgs),

    /// Add a dylib dependency to the main executable
    Inject {
        /// App bundle or Mach-O file
        app: PathBuf,
        /// Load path, e.g. "@executable_path/Tweak.dylib"
        dylib: String,
        /// Use LC_LOAD_WEAK_DYLIB
        #[arg(short, long)]
        weak: bool,
    },

    /// Remove dylib dependencies
    Uninstall {
        /// App bundle or Mach-O file
        app: PathBuf,
        /// Load paths to remove
        #[arg(required = true)]
        dylibs: Vec<String>,
    },

    /// List dylib dependencies
    List {
        /// App bundle or Mach-O file
        app: PathBuf,
    },

    /// Rename a dylib dependency
    Change {
        /// App bundle or Mach-O file
        app: PathBuf,
        /// Current load path
        old: String,
        /// Replacement load path
        new: String,
    },
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Input: .app, directory containing Payload/, .ipa or Mach-O file
    input: PathBuf,

    /// Output file (.ipa for bundles); signs in place when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Certificate file (PEM or DER)
    #[arg(short = 'c', long)]
    certificate: Option<PathBuf>,

    /// Private key file, or PEM holding key and certificate
    #[arg(short = 'k', long)]
    private_key: Option<PathBuf>,

    /// PKCS#12 file (.p12)
    #[arg(short = 'p', long)]
    pkcs12: Option<PathBuf>,

    /// Provisioning profile
    #[arg(short = 'm', long)]
    profile: Option<PathBuf>,

    /// Password for private key or PKCS#12
    #[arg(long, env = "MACHSIGN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Sign without a certificate
    #[arg(short = 'a', long)]
    adhoc: bool,

    /// New CFBundleIdentifier
    #[arg(short = 'b', long)]
    bundle_id: Option<String>,

    /// New CFBundleDisplayName
    #[arg(short = 'n', long)]
    display_name: Option<String>,

    /// New CFBundleVersion and CFBundleShortVersionString
    #[arg(short = 'r', long)]
    bundle_version: Option<String>,

    /// Dylib to copy into the bundle and inject (repeatable)
    #[arg(short = 'l', long)]
    inject: Vec<PathBuf>,

    /// Inject the dylibs weakly
    #[arg(short = 'w', long)]
    weak: bool,

    /// Do not write embedded.mobileprovision
    #[arg(long)]
    no_embed_profile: bool,

    /// ZIP compression level (0-9)
    #[arg(short = 'z', long, default_value = "6")]
    zip_level: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Sign(args) => cmd_sign(args),
        Commands::Inject { app, dylib, weak } => {
            let outcome = macho::inject_dylib(&app, &dylib, weak)
                .with_context(|| format!("Failed to inject {} into {}", dylib, app.display()))?;
            println!("{}: {:?}", dylib, outcome);
            Ok(())
        }
        Commands::Uninstall { app, dylibs } => {
            let removed = macho::uninstall_dylibs(&app, dylibs.as_slice())
                .with_context(|| format!("Failed to uninstall dylibs from {}", app.display()))?;
            println!("Removed {} load command(s)", removed);
            Ok(())
        }
        Commands::List { app } => {
            let dylibs = macho::list_dylibs(&app)
                .with_context(|| format!("Failed to read {}", app.display()))?;
            for dylib in dylibs {
                println!("{}", dylib);
            }
            Ok(())
        }
        Commands::Change { app, old, new } => {
            macho::change_dylib_path(&app, &old, &new)
                .with_context(|| format!("Failed to change {} in {}", old, app.display()))?;
            println!("{} -> {}", old, new);
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn cmd_sign(args: SignArgs) -> Result<()> {
    let mut signer = ZSign::new()
        .adhoc(args.adhoc)
        .embed_profile(!args.no_embed_profile)
        .compression_level(args.zip_level);

    if let Some(path) = args.pkcs12 {
        signer = signer.pkcs12(path);
    }
    if let Some(path) = args.private_key {
        signer = signer.private_key(path);
    }
    if let Some(path) = args.certificate {
        signer = signer.certificate(path);
    }
    if let Some(password) = args.password {
        signer = signer.password(password);
    }
    if let Some(path) = args.profile {
        signer = signer.provisioning_profile(path);
    }
    if let Some(id) = args.bundle_id {
        signer = signer.bundle_id(id);
    }
    if let Some(name) = args.display_name {
        signer = signer.display_name(name);
    }
    if let Some(version) = args.bundle_version {
        signer = signer.bundle_version(version);
    }
    for dylib in args.inject {
        signer = signer.inject_dylib(dylib, args.weak);
    }

    signer.validate().context("Invalid signing configuration")?;
    let written = signer
        .sign(&args.input, args.output.as_deref())
        .with_context(|| format!("Failed to sign {}", args.input.display()))?;

    info!(path = %written.display(), "done");
    println!("Signed: {}", written.display());
    Ok(())
}
