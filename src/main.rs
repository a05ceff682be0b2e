use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pubgate::{cli, config, gateway, Core};

#[derive(Parser)]
#[command(name = "pubgate")]
#[command(version, about = "Reliable HTTP-to-AMQP publish gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Address to listen on (overrides gateway.listen)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Publish a single message and exit
    Publish {
        /// Queue to publish to (defaults to gateway.default_destination)
        #[arg(long)]
        destination: Option<String>,

        /// Message body (defaults to gateway.default_payload)
        message: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Choose runtime based on mode:
    // - Serve: multi_thread for concurrent request handling
    // - Publish: current_thread, a single message needs no parallelism
    let runtime = match cli.command {
        Commands::Serve { .. } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?,
        Commands::Publish { .. } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?,
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = config::load_config(cli.config.as_deref())?;

    // Initialize core
    let core = Core::new(config)?;

    match cli.command {
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| core.config.gateway.listen.clone());
            gateway::run_server(&core, &listen).await?;
        }
        Commands::Publish {
            destination,
            message,
        } => {
            cli::cmd_publish(&core, destination.as_deref(), message.as_deref()).await?;
        }
    }

    Ok(())
}
