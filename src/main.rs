use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use opsdash::core::currency::Currency;
use opsdash::core::log::init_logging;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct ViewArgs {
    /// Month to report on (1-12); implies a per-period view
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: Option<u32>,

    /// Year to report on; defaults to the current year when a month is given
    #[arg(short, long)]
    year: Option<i32>,

    /// Display currency (USD, VND or EUR); defaults to the configured one
    #[arg(long)]
    currency: Option<Currency>,
}

impl From<ViewArgs> for opsdash::ViewOptions {
    fn from(args: ViewArgs) -> Self {
        opsdash::ViewOptions {
            month: args.month,
            year: args.year,
            currency: args.currency,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Compute and print the dashboard once
    Summary(ViewArgs),
    /// Keep the dashboard live until interrupted
    Watch(ViewArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config_path = cli.config_path.as_deref();
    let result = match cli.command {
        Some(Commands::Setup) => match config_path {
            Some(path) => opsdash::cli::setup::setup_at_path(path),
            None => opsdash::cli::setup::setup(),
        },
        Some(Commands::Summary(args)) => {
            opsdash::run_command(opsdash::AppCommand::Summary(args.into()), config_path).await
        }
        Some(Commands::Watch(args)) => {
            opsdash::run_command(opsdash::AppCommand::Watch(args.into()), config_path).await
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
