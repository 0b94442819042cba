use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Use the local store even when a remote backend is configured
    #[arg(long, global = true)]
    pub local: bool,

    /// Path of the local SQLite file
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show task counts, weekly completion and low-stock products
    Dashboard,

    /// List tasks (overdue tasks are marked on load)
    TaskList,
    /// Create a pending task
    TaskAdd {
        #[arg(value_name = "TITLE")]
        title: String,
        #[arg(short, long)]
        assignee: String,
        /// Due date, YYYY-MM-DD
        #[arg(short = 'd', long = "due")]
        due: NaiveDate,
        #[arg(long)]
        description: Option<String>,
    },
    /// Mark a pending task completed
    TaskComplete {
        #[arg(value_name = "TASK")]
        task: String,
    },
    /// Change fields of a task
    TaskEdit {
        #[arg(value_name = "TASK")]
        task: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        assignee: Option<String>,
        #[arg(short = 'd', long = "due")]
        due: Option<NaiveDate>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a task
    TaskDelete {
        #[arg(value_name = "TASK")]
        task: String,
    },

    /// List team members
    MemberList,
    /// Add a team member
    MemberAdd {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Rename a team member
    MemberRename {
        #[arg(value_name = "MEMBER")]
        member: String,
        #[arg(value_name = "NEW_NAME")]
        name: String,
    },
    /// Remove a team member
    MemberDelete {
        #[arg(value_name = "MEMBER")]
        member: String,
    },

    /// List products grouped by category
    ProductList {
        /// Only products below their threshold
        #[arg(long)]
        low: bool,
    },
    /// Add a product
    ProductAdd {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(short, long, default_value_t = 0)]
        stock: i64,
        #[arg(short, long, default_value_t = 10)]
        threshold: i64,
        /// Category id or name; the default category when omitted
        #[arg(short, long)]
        category: Option<String>,
    },
    /// Change fields of a product
    ProductEdit {
        #[arg(value_name = "PRODUCT")]
        product: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        stock: Option<i64>,
        #[arg(short, long)]
        threshold: Option<i64>,
    },
    /// Delete a product
    ProductDelete {
        #[arg(value_name = "PRODUCT")]
        product: String,
    },
    /// Take units out of stock
    Outbound {
        #[arg(value_name = "PRODUCT")]
        product: String,
        #[arg(value_name = "QUANTITY")]
        quantity: i64,
    },
    /// Put units into stock
    Inbound {
        #[arg(value_name = "PRODUCT")]
        product: String,
        #[arg(value_name = "QUANTITY")]
        quantity: i64,
    },
    /// Move a product to another category
    ProductMove {
        #[arg(value_name = "PRODUCT")]
        product: String,
        #[arg(value_name = "CATEGORY")]
        category: String,
    },

    /// List categories with their product counts
    CategoryList,
    /// Add a category
    CategoryAdd {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Rename a category
    CategoryRename {
        #[arg(value_name = "CATEGORY")]
        category: String,
        #[arg(value_name = "NEW_NAME")]
        name: String,
    },
    /// Delete a category, moving its products to the default category
    CategoryDelete {
        #[arg(value_name = "CATEGORY")]
        category: String,
    },

    /// Set a configuration value
    Set {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "VALUE")]
        value: String,
    },
    /// Get a configuration value
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },
    /// List all configuration values
    ConfigList,
    /// Delete a configuration value
    ConfigDelete {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Show which backend this session uses and why
    Backend,
    /// Check the remote configuration and every hosted table
    Doctor,
    /// Print the SQL that creates the hosted tables
    Schema,
    /// List writes queued after remote failures
    OutboxList,
    /// Re-send queued writes to the remote backend
    OutboxReplay,
    /// Drop all queued writes
    OutboxClear,

    /// Launch TUI interface
    Tui,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, elvish, powershell)
        #[arg(value_name = "SHELL")]
        shell: String,
    },
}
