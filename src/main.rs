mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use voxgate::Config;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voxgate=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Detect {
        input: None,
        save_chunks: None,
    });

    // These don't need a valid config or the async runtime.
    match &command {
        Commands::Config => {
            print!("{}", Config::generate_default_commented());
            return Ok(());
        }
        Commands::Devices => return commands::list_devices(),
        _ => {}
    }

    let config = Config::load(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match command {
        Commands::Calibrate { input } => commands::calibrate(&config, input.as_deref(), &runtime),
        Commands::Detect { input, save_chunks } => {
            tracing::info!("Starting voxgate detector");
            commands::detect(&config, input.as_deref(), save_chunks, &runtime)
        }
        Commands::Analyze { wav, json } => commands::analyze(&config, &wav, json, &runtime),
        Commands::Thresholds => commands::show_thresholds(&config.output.thresholds_path),
        Commands::Config | Commands::Devices => Ok(()),
    }
}
