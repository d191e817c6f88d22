//! murmur CLI: the main entry point.
//!
//! Commands:
//! - `chat`   : Talk to the assistant in a terminal conversation
//! - `tasks`  : List or cancel a user's pending reminders
//! - `memory` : Show or reset what the assistant knows about a user
//! - `config` : Write or print the configuration

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "murmur",
    about = "murmur: a group-chat assistant with memory and reminders",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation
    Chat {
        /// Conversation to join
        #[arg(short, long, default_value = "terminal")]
        conversation: String,

        /// Your user id
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Your display name
        #[arg(short, long, env = "USER", default_value = "you")]
        name: String,
    },

    /// Manage scheduled reminders
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Manage user profiles
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List pending reminders
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Cancel a pending reminder
    Cancel {
        id: i64,
        #[arg(short, long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print a user's profile
    Show {
        #[arg(short, long)]
        user: String,
    },
    /// Delete a user's profile
    Reset {
        #[arg(short, long)]
        user: String,
    },
    /// List every known profile
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Chat {
            conversation,
            user,
            name,
        } => commands::chat::run(conversation, user, name, cli.verbose).await?,
        Commands::Tasks { action } => match action {
            TasksAction::List { user } => commands::tasks::list(&user).await?,
            TasksAction::Cancel { id, user } => commands::tasks::cancel(id, &user).await?,
        },
        Commands::Memory { action } => match action {
            MemoryAction::Show { user } => commands::memory::show(&user).await?,
            MemoryAction::Reset { user } => commands::memory::reset(&user).await?,
            MemoryAction::List => commands::memory::list().await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force)?,
            ConfigAction::Show => commands::config_cmd::show()?,
        },
    }

    Ok(())
}
