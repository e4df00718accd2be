use clap::{Parser, Subcommand};
use lib::channels::OutboundMessage;
use lib::runtime::{EchoHandler, InboundHandler, LogHandler};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier: message channel adapters (Signal, ntfy, iMessage, Omi)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Start every enabled channel and log inbound messages until Ctrl+C or SIGTERM.
    Run {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Reply to every inbound message with its own content.
        #[arg(long)]
        echo: bool,
    },

    /// Send one message through a channel and exit.
    Send {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Channel name: signal, ntfy, imsg or omi.
        #[arg(long)]
        channel: String,

        /// Recipient: phone number, Signal group id, ntfy topic, iMessage handle.
        #[arg(long, default_value = "")]
        chat_id: String,

        /// Address a Signal group rather than a single recipient.
        #[arg(long)]
        group: bool,

        /// ntfy notification title.
        #[arg(long)]
        title: Option<String>,

        /// ntfy priority (1-5 or min/low/default/high/max).
        #[arg(long)]
        priority: Option<String>,

        /// Message text.
        text: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run { config, echo }) => {
            if let Err(e) = run_channels(config, echo).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            channel,
            chat_id,
            group,
            title,
            priority,
            text,
        }) => {
            let mut msg = OutboundMessage::new(channel, chat_id, text);
            if group {
                msg = msg.with_metadata("is_group", true);
            }
            if let Some(title) = title {
                msg = msg.with_metadata("title", title);
            }
            if let Some(priority) = priority {
                msg = msg.with_metadata("priority", priority);
            }
            if let Err(e) = send_message(config, msg).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_channels(config_path: Option<std::path::PathBuf>, echo: bool) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    let handler: Arc<dyn InboundHandler> = if echo {
        Arc::new(EchoHandler)
    } else {
        Arc::new(LogHandler)
    };
    lib::runtime::run(config, handler).await
}

async fn send_message(
    config_path: Option<std::path::PathBuf>,
    msg: OutboundMessage,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    lib::runtime::send_once(config, msg).await
}
