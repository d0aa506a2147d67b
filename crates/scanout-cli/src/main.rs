use clap::{Parser, Subcommand};
use tracing::info;

mod sim;

#[derive(Parser)]
#[command(name = "scanout")]
#[command(about = "Scanout - frame commit pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the commit pipeline against a simulated GPU
    Simulate {
        /// Number of frames to submit (overrides the config file)
        #[arg(short, long)]
        frames: Option<u32>,

        /// Number of client buffers to cycle through (overrides the config file)
        #[arg(short, long)]
        buffers: Option<u32>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scanout_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            frames,
            buffers,
            config,
        } => {
            let path = config.unwrap_or_else(scanout_core::config::default_config_path);
            let mut config = scanout_core::ScanoutConfig::load_or_default(&path);
            if let Some(frames) = frames {
                config.simulation.frames = frames;
            }
            if let Some(buffers) = buffers {
                config.simulation.buffers = buffers;
            }
            if config.simulation.buffers == 0 {
                anyhow::bail!("simulation needs at least one buffer");
            }

            info!(
                frames = config.simulation.frames,
                buffers = config.simulation.buffers,
                "starting simulation"
            );
            let report = sim::run(config).await?;
            report.print();
        }

        Commands::Config { config } => {
            let path = config.unwrap_or_else(scanout_core::config::default_config_path);
            let config = scanout_core::ScanoutConfig::load_or_default(&path);
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}
