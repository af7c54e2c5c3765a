//! Bazaar: realtime feed client
//!
//! Subcommands:
//! - `watch`: follow a user's notifications, connections and (optionally) one conversation live
//! - `trending`: print trending posts and suggested users as they are polled
//! - `demo`: scripted walkthrough against the in-memory backend

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod demo;
mod watch;

#[derive(Parser)]
#[command(name = "bazaar")]
#[command(about = "Realtime feeds for the Bazaar marketplace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Backend connection shared by the live subcommands.
#[derive(Args, Debug, Clone)]
struct Connection {
    /// Project base URL
    #[arg(long, env = "BAZAAR_URL")]
    url: String,

    /// Public API key
    #[arg(long, env = "BAZAAR_API_KEY")]
    api_key: String,

    /// Session token of the signed-in user
    #[arg(long, env = "BAZAAR_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Identifier of the signed-in user
    #[arg(long, env = "BAZAAR_USER_ID")]
    user_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow notifications, connection requests and a conversation live
    Watch {
        #[command(flatten)]
        connection: Connection,

        /// Conversation to open
        #[arg(long)]
        conversation: Option<String>,

        /// Rows per page
        #[arg(long, default_value = "50")]
        page_size: usize,
    },

    /// Print trending posts and suggested users
    Trending {
        #[command(flatten)]
        connection: Connection,

        /// Poll interval in seconds
        #[arg(long, env = "BAZAAR_TRENDING_POLL_SECS", default_value = "60")]
        poll_interval: u64,
    },

    /// Run a scripted session against the in-memory backend
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bazaar=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            connection,
            conversation,
            page_size,
        } => watch::run(&connection, conversation.as_deref(), page_size).await,

        Commands::Trending {
            connection,
            poll_interval,
        } => watch::run_trending(&connection, poll_interval).await,

        Commands::Demo => demo::run().await,
    }
}
