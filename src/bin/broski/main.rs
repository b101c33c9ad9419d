//! BROski CLI
//!
//! Check rewards, the leaderboard, feature access and quests from the terminal.

mod client;
mod commands;
mod style;

use clap::{Parser, Subcommand};
use style::*;

const BANNER: &str = r#"
  ██████╗ ██████╗  ██████╗ ███████╗██╗  ██╗██╗
  ██╔══██╗██╔══██╗██╔═══██╗██╔════╝██║ ██╔╝██║
  ██████╔╝██████╔╝██║   ██║███████╗█████╔╝ ██║
  ██╔══██╗██╔══██╗██║   ██║╚════██║██╔═██╗ ██║
  ██████╔╝██║  ██║╚██████╔╝███████║██║  ██╗██║
  ╚═════╝ ╚═╝  ╚═╝ ╚═════╝ ╚══════╝╚═╝  ╚═╝╚═╝
"#;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "broski")]
#[command(author = "HyperCode")]
#[command(version)]
#[command(about = "BROski$ rewards for the HyperCode IDE", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Rewards server URL
    #[arg(
        short,
        long,
        env = "BROSKI_SERVER",
        default_value = "http://localhost:5000",
        global = true
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show reward totals for an address
    #[command(visible_alias = "r")]
    Rewards {
        /// Wallet address
        address: String,
    },

    /// View the deployment leaderboard
    #[command(visible_alias = "lb")]
    Leaderboard {
        /// week or month
        #[arg(short, long, default_value = "week")]
        timeframe: String,

        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check which features an address can use
    #[command(visible_alias = "a")]
    Access {
        /// Feature names
        #[arg(required = true)]
        features: Vec<String>,

        /// Wallet address
        #[arg(short, long, env = "BROSKI_ADDRESS")]
        address: String,
    },

    /// List quests and your progress
    #[command(visible_alias = "q")]
    Quests {
        /// Wallet address
        #[arg(short, long, env = "BROSKI_ADDRESS")]
        address: Option<String>,
    },

    /// Claim a completed quest
    Claim {
        /// Quest id
        quest: String,

        /// Wallet address
        #[arg(short, long, env = "BROSKI_ADDRESS")]
        address: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    let result = match cli.command {
        Commands::Rewards { address } => {
            print_banner();
            commands::rewards::run(&cli.server, &address).await
        }
        Commands::Leaderboard { timeframe, limit } => {
            commands::leaderboard::run(&cli.server, &timeframe, limit).await
        }
        Commands::Access { features, address } => {
            commands::access::run(&cli.server, &address, &features).await
        }
        Commands::Quests { address } => {
            commands::quests::list(&cli.server, address.as_deref()).await
        }
        Commands::Claim { quest, address } => {
            commands::quests::claim(&cli.server, &quest, &address).await
        }
    };

    if let Err(e) = result {
        print_error(&format!("{}", e));
        std::process::exit(1);
    }
}

pub fn print_banner() {
    println!("{}", style_cyan(BANNER));
    println!(
        "  {} {}",
        style_dim("BROski Rewards"),
        style_dim(&format!("v{}", VERSION))
    );
    println!();
}
