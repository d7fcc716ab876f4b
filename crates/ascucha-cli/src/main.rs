use anyhow::Result;
use ascucha_core::{InboundMessage, IngestMode};
use ascucha_ingest::{IngestConfig, PlatformRegistry, RoutingEngine};
use ascucha_web::{reply_text, IngestReply};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "ascucha")]
#[command(about = "Ascucha music link ledger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Command,
    Passive,
}

impl From<ModeArg> for IngestMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Command => IngestMode::Command,
            ModeArg::Passive => IngestMode::Passive,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one message and print the outcome as JSON.
    Ingest {
        text: String,
        #[arg(long, value_enum, default_value = "command")]
        mode: ModeArg,
        #[arg(long, default_value = "")]
        sender: String,
        #[arg(long, default_value = "")]
        chat: String,
        #[arg(long, default_value = "")]
        permalink: String,
    },
    /// Print the platform a URL belongs to.
    Classify { url: String },
    /// Run the HTTP adapter.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest {
            text,
            mode,
            sender,
            chat,
            permalink,
        } => {
            let engine = RoutingEngine::from_config(&config).await?;
            let message = InboundMessage {
                text,
                html_text: String::new(),
                sender_display_name: sender,
                source_chat_label: chat,
                message_permalink: permalink,
                mode: mode.into(),
            };
            let outcome = engine.ingest(&message).await?;
            let reply = reply_text(&outcome, &config.parser.command);
            println!("{}", serde_json::to_string_pretty(&IngestReply { outcome, reply })?);
        }
        Commands::Classify { url } => {
            let registry = match &config.platforms_file {
                Some(path) => PlatformRegistry::load(path).await?,
                None => PlatformRegistry::default(),
            };
            match registry.classify(&url) {
                Some(platform) => println!("{platform}"),
                None => println!("unrecognized"),
            }
        }
        Commands::Serve => {
            tracing::info!(store = %config.store_backend, "starting http adapter");
            ascucha_web::serve_from_env().await?;
        }
    }

    Ok(())
}
