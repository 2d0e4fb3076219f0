//! crossdock CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{PlanFormat, PublishArgs, ReleaseOverrides};

#[derive(Parser)]
#[command(name = "crossdock")]
#[command(about = "Cross-compile a Rust workspace and publish multi-architecture images", long_about = None)]
struct Cli {
    /// Path to the release configuration
    #[arg(short, long, global = true, env = "CROSSDOCK_CONFIG", default_value = "crossdock.kdl")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, collect, provision and publish
    Run {
        #[command(flatten)]
        overrides: ReleaseOverrides,

        #[command(flatten)]
        publish: PublishArgs,

        /// Build and collect only
        #[arg(long)]
        skip_publish: bool,
    },
    /// Validate the release configuration
    Validate,
    /// Show what a run would build and push
    Plan {
        #[command(flatten)]
        overrides: ReleaseOverrides,

        #[arg(long, value_enum, default_value = "text")]
        format: PlanFormat,
    },
    /// Create the image repository if it does not exist
    Provision {
        #[command(flatten)]
        overrides: ReleaseOverrides,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run {
            overrides,
            publish,
            skip_publish,
        } => {
            let code =
                commands::run::run_release(&cli.config, &overrides, &publish, skip_publish).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Plan { overrides, format } => {
            commands::plan(&cli.config, &overrides, format)?;
        }
        Commands::Provision { overrides } => {
            commands::provision::provision(&cli.config, &overrides).await?;
        }
    }

    Ok(())
}
