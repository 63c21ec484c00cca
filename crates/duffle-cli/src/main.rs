//! Duffle CLI - install and manage Cloud Native Application Bundles

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod exit_codes;
mod home;

use commands::{ActionArgs, Context, StorageKind};
use home::DuffleHome;

#[derive(Parser)]
#[command(name = "duffle")]
#[command(author = "Duffle Contributors")]
#[command(version)]
#[command(about = "Install and manage Cloud Native Application Bundles", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Location of duffle's local state
    #[arg(long, global = true, env = "DUFFLE_HOME")]
    home: Option<PathBuf>,

    /// Claim storage backend
    #[arg(long, global = true, value_enum, env = "DUFFLE_STORAGE", default_value = "file")]
    storage: StorageKind,

    /// Connection string for the mongodb storage backend
    #[arg(long, global = true, env = "DUFFLE_STORAGE_URL")]
    storage_url: Option<String>,

    /// Namespace for the configmap storage backend
    #[arg(long, global = true, default_value = "default")]
    namespace: String,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a bundle as a new installation
    Install {
        /// Installation (claim) name
        name: String,

        /// Path to bundle.json
        bundle_file: PathBuf,

        #[command(flatten)]
        action: ActionArgs,
    },

    /// Upgrade an existing installation
    Upgrade {
        /// Installation (claim) name
        name: String,

        /// Replace the installation's bundle
        #[arg(short, long)]
        bundle_file: Option<PathBuf>,

        #[command(flatten)]
        action: ActionArgs,
    },

    /// Uninstall an installation and remove its claim
    Uninstall {
        /// Installation (claim) name
        name: String,

        /// Use this bundle instead of the one stored in the claim
        #[arg(short, long)]
        bundle_file: Option<PathBuf>,

        #[command(flatten)]
        action: ActionArgs,
    },

    /// Query the live status of an installation
    Status {
        /// Installation (claim) name
        name: String,

        #[command(flatten)]
        action: ActionArgs,
    },

    /// Run a custom action declared by the bundle
    Run {
        /// Custom action name
        action_name: String,

        /// Installation (claim) name
        #[arg(long = "claim")]
        claim: String,

        /// Bundle to run; creates a new claim if none exists
        #[arg(short, long)]
        bundle_file: Option<PathBuf>,

        #[command(flatten)]
        action: ActionArgs,
    },

    /// Inspect stored claims
    Claims {
        #[command(subcommand)]
        command: ClaimsCommands,
    },

    /// Manage credential sets
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommands,
    },

    /// List built-in drivers and their configuration
    Drivers,
}

#[derive(Subcommand)]
enum ClaimsCommands {
    /// List installation names
    List,

    /// Print a claim as JSON
    Show {
        /// Installation (claim) name
        name: String,
    },
}

#[derive(Subcommand)]
enum CredentialsCommands {
    /// List credential sets in the duffle home
    List,
}

/// Route library logs to stderr; stdout belongs to the invocation image
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_logging(cli.debug);

    let ctx = Context {
        home: DuffleHome::resolve(cli.home),
        storage: cli.storage,
        storage_url: cli.storage_url,
        namespace: cli.namespace,
    };
    tracing::debug!(home = %ctx.home.root().display(), "using duffle home");

    let result = match cli.command {
        Commands::Install {
            name,
            bundle_file,
            action,
        } => commands::install::run(&ctx, &name, &bundle_file, &action).await,

        Commands::Upgrade {
            name,
            bundle_file,
            action,
        } => commands::upgrade::run(&ctx, &name, bundle_file.as_deref(), &action).await,

        Commands::Uninstall {
            name,
            bundle_file,
            action,
        } => commands::uninstall::run(&ctx, &name, bundle_file.as_deref(), &action).await,

        Commands::Status { name, action } => commands::status::run(&ctx, &name, &action).await,

        Commands::Run {
            action_name,
            claim,
            bundle_file,
            action,
        } => {
            commands::run::run(&ctx, &action_name, &claim, bundle_file.as_deref(), &action).await
        }

        Commands::Claims { command } => match command {
            ClaimsCommands::List => commands::claims::list(&ctx).await,
            ClaimsCommands::Show { name } => commands::claims::show(&ctx, &name).await,
        },

        Commands::Credentials { command } => match command {
            CredentialsCommands::List => commands::credentials::list(&ctx),
        },

        Commands::Drivers => commands::drivers::run(),
    };

    if let Err(err) = result {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
