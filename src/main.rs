mod cli;
mod commands;
mod config;
mod console;
mod error;
mod lookup;
mod models;
mod outbox;
mod rules;
mod storage;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use cli::{Cli, Commands};
use config::Settings;
use console::Console;
use models::{ProductPatch, TaskPatch};
use storage::{select_backend, LocalStore, SCHEMA_SQL};
use ui::run_tui;

fn log_file_path() -> PathBuf {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home_dir).join(".opsdesk.log")
}

/// `warn` by default, `-v` for info, `-vv` for debug; `RUST_LOG` overrides.
/// The TUI owns the terminal, so its log goes to a file.
fn init_logging(verbose: u8, tui: bool) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    if tui {
        match OpenOptions::new().create(true).append(true).open(log_file_path()) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(_) => {
                builder.filter_level(LevelFilter::Off);
            }
        }
    }
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env.local first: dotenv never overrides a variable that is already set.
    dotenv::from_filename(".env.local").ok();
    dotenv::dotenv().ok();

    let command = cli.command.unwrap_or(Commands::Tui);
    init_logging(cli.verbose, matches!(command, Commands::Tui));

    let db_path = config::db_path(cli.db);
    let force_local = cli.local;
    let open_store = || -> Result<Arc<LocalStore>> {
        let store = LocalStore::open(&db_path)
            .with_context(|| format!("Failed to open local store at {}", db_path.display()))?;
        Ok(Arc::new(store))
    };

    let rt = tokio::runtime::Runtime::new()?;
    let connect = || -> Result<Console> {
        let store = open_store()?;
        let settings = Settings::resolve(&store, force_local)?;
        let ctx = rt.block_on(select_backend(&settings, store));
        Ok(Console::new(ctx))
    };

    match command {
        Commands::Dashboard => rt.block_on(commands::dashboard(&connect()?))?,

        Commands::TaskList => rt.block_on(commands::task_list(&connect()?))?,
        Commands::TaskAdd {
            title,
            assignee,
            due,
            description,
        } => rt.block_on(commands::task_add(
            &connect()?,
            &title,
            &assignee,
            due,
            description,
        ))?,
        Commands::TaskComplete { task } => {
            rt.block_on(commands::task_complete(&connect()?, &task))?
        }
        Commands::TaskEdit {
            task,
            title,
            assignee,
            due,
            description,
        } => {
            let patch = TaskPatch {
                title,
                description,
                assignee,
                due_date: due,
                status: None,
            };
            rt.block_on(commands::task_edit(&connect()?, &task, patch))?
        }
        Commands::TaskDelete { task } => rt.block_on(commands::task_delete(&connect()?, &task))?,

        Commands::MemberList => rt.block_on(commands::member_list(&connect()?))?,
        Commands::MemberAdd { name } => rt.block_on(commands::member_add(&connect()?, &name))?,
        Commands::MemberRename { member, name } => {
            rt.block_on(commands::member_rename(&connect()?, &member, &name))?
        }
        Commands::MemberDelete { member } => {
            rt.block_on(commands::member_delete(&connect()?, &member))?
        }

        Commands::ProductList { low } => rt.block_on(commands::product_list(&connect()?, low))?,
        Commands::ProductAdd {
            name,
            stock,
            threshold,
            category,
        } => rt.block_on(commands::product_add(
            &connect()?,
            &name,
            stock,
            threshold,
            category.as_deref(),
        ))?,
        Commands::ProductEdit {
            product,
            name,
            stock,
            threshold,
        } => {
            let patch = ProductPatch {
                name,
                stock,
                threshold,
                category_id: None,
            };
            rt.block_on(commands::product_edit(&connect()?, &product, patch))?
        }
        Commands::ProductDelete { product } => {
            rt.block_on(commands::product_delete(&connect()?, &product))?
        }
        Commands::Outbound { product, quantity } => {
            rt.block_on(commands::outbound(&connect()?, &product, quantity))?
        }
        Commands::Inbound { product, quantity } => {
            rt.block_on(commands::inbound(&connect()?, &product, quantity))?
        }
        Commands::ProductMove { product, category } => {
            rt.block_on(commands::product_move(&connect()?, &product, &category))?
        }

        Commands::CategoryList => rt.block_on(commands::category_list(&connect()?))?,
        Commands::CategoryAdd { name } => {
            rt.block_on(commands::category_add(&connect()?, &name))?
        }
        Commands::CategoryRename { category, name } => {
            rt.block_on(commands::category_rename(&connect()?, &category, &name))?
        }
        Commands::CategoryDelete { category } => {
            rt.block_on(commands::category_delete(&connect()?, &category))?
        }

        Commands::Set { key, value } => commands::set_config(&*open_store()?, &key, &value)?,
        Commands::Get { key } => commands::get_config(&*open_store()?, &key)?,
        Commands::ConfigList => commands::list_configs(&*open_store()?)?,
        Commands::ConfigDelete { key } => commands::delete_config(&*open_store()?, &key)?,

        Commands::Backend => commands::backend(&connect()?)?,
        Commands::Doctor => {
            let store = open_store()?;
            let settings = Settings::resolve(&store, force_local)?;
            rt.block_on(commands::doctor(&settings))?
        }
        Commands::Schema => print!("{}", SCHEMA_SQL),
        Commands::OutboxList => commands::outbox_list(&*open_store()?)?,
        Commands::OutboxReplay => rt.block_on(commands::outbox_replay(&connect()?))?,
        Commands::OutboxClear => commands::outbox_clear(&*open_store()?)?,

        Commands::Tui => run_tui(connect()?, &rt)?,
        Commands::Completions { shell } => commands::completions(&shell)?,
    }

    Ok(())
}
