//! Handlers behind the CLI subcommands. Each prints its own result.

use anyhow::{bail, Context, Result};
use clap::CommandFactory;
use std::collections::HashMap;

use crate::cli::Cli;
use crate::config::{self, Settings};
use crate::console::{Console, Level, Notice};
use crate::error::StorageError;
use crate::lookup::{self, ask_user_confirmation};
use crate::models::{Category, Member, Product, ProductPatch, Task, TaskPatch, TaskStatus};
use crate::outbox;
use crate::rules;
use crate::storage::{has_valid_remote_config, LocalStore, RemoteStore, Storage, TABLES};

pub fn print_notices(notices: &[Notice]) {
    for notice in notices {
        match notice.level {
            Level::Info => println!("{}", notice),
            Level::Warning | Level::Error => eprintln!("{}", notice),
        }
    }
}

fn status_marker(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "[ ]",
        TaskStatus::Completed => "[x]",
        TaskStatus::Overdue => "[!]",
    }
}

async fn pick_task(console: &Console, query: &str) -> Result<Task> {
    let loaded = console.load_tasks().await?;
    print_notices(&loaded.notices);
    let task = lookup::resolve(&loaded.value, query, "task", ask_user_confirmation)?;
    Ok(task.clone())
}

async fn pick_member(console: &Console, query: &str) -> Result<Member> {
    let members = console.load_members().await?;
    let member = lookup::resolve(&members, query, "member", ask_user_confirmation)?;
    Ok(member.clone())
}

async fn pick_product(console: &Console, query: &str) -> Result<Product> {
    let inventory = console.load_inventory().await?;
    let product = lookup::resolve(&inventory.value.products, query, "product", ask_user_confirmation)?;
    Ok(product.clone())
}

async fn pick_category(console: &Console, query: &str) -> Result<Category> {
    let inventory = console.load_inventory().await?;
    let category = lookup::resolve(
        &inventory.value.categories,
        query,
        "category",
        ask_user_confirmation,
    )?;
    Ok(category.clone())
}

// Dashboard

pub async fn dashboard(console: &Console) -> Result<()> {
    let outcome = console.dashboard().await?;
    print_notices(&outcome.notices);
    let summary = outcome.value;

    println!("Dashboard ({} backend)", console.context().kind());
    println!("---------");
    println!("Tasks:           {}", summary.total_tasks);
    println!("  completed:     {}", summary.completed_tasks);
    println!("  pending:       {}", summary.pending_tasks);
    println!("  overdue:       {}", summary.overdue_tasks);
    println!("Weekly completion: {}%", summary.weekly_completion_rate);
    println!("Low stock:       {}", summary.low_stock.len());
    for product in &summary.low_stock {
        println!(
            "  {} | Stock: {} | Threshold: {}",
            product.name, product.stock, product.threshold
        );
    }
    Ok(())
}

// Tasks

pub async fn task_list(console: &Console) -> Result<()> {
    let outcome = console.load_tasks().await?;
    print_notices(&outcome.notices);

    println!("Tasks:");
    println!("------");
    for task in &outcome.value {
        println!(
            "{} {} | Assignee: {} | Due: {} | Status: {} | Id: {}",
            status_marker(task.status),
            task.title,
            task.assignee,
            task.due_date,
            task.status,
            task.id
        );
        if let Some(description) = &task.description {
            println!("    {}", description);
        }
    }
    Ok(())
}

pub async fn task_add(
    console: &Console,
    title: &str,
    assignee: &str,
    due: chrono::NaiveDate,
    description: Option<String>,
) -> Result<()> {
    let outcome = console.create_task(title, assignee, due, description).await?;
    print_notices(&outcome.notices);
    println!("Task '{}' created (id {})", outcome.value.title, outcome.value.id);
    Ok(())
}

pub async fn task_complete(console: &Console, query: &str) -> Result<()> {
    let task = pick_task(console, query).await?;
    let outcome = console.complete_task(&task.id).await?;
    print_notices(&outcome.notices);
    println!("Task '{}' completed", task.title);
    Ok(())
}

pub async fn task_edit(console: &Console, query: &str, patch: TaskPatch) -> Result<()> {
    let task = pick_task(console, query).await?;
    let outcome = console.edit_task(&task.id, patch).await?;
    print_notices(&outcome.notices);
    println!("Task '{}' updated", task.title);
    Ok(())
}

pub async fn task_delete(console: &Console, query: &str) -> Result<()> {
    let task = pick_task(console, query).await?;
    let outcome = console.delete_task(&task.id).await?;
    print_notices(&outcome.notices);
    println!("Task '{}' deleted", task.title);
    Ok(())
}

// Members

pub async fn member_list(console: &Console) -> Result<()> {
    let members = console.load_members().await?;
    println!("Members:");
    println!("--------");
    for member in &members {
        println!("{} | Id: {}", member.name, member.id);
    }
    Ok(())
}

pub async fn member_add(console: &Console, name: &str) -> Result<()> {
    let outcome = console.add_member(name).await?;
    print_notices(&outcome.notices);
    println!("Member '{}' added (id {})", outcome.value.name, outcome.value.id);
    Ok(())
}

pub async fn member_rename(console: &Console, query: &str, name: &str) -> Result<()> {
    let member = pick_member(console, query).await?;
    let outcome = console.rename_member(&member.id, name).await?;
    print_notices(&outcome.notices);
    println!("Member '{}' renamed to '{}'", member.name, name.trim());
    Ok(())
}

pub async fn member_delete(console: &Console, query: &str) -> Result<()> {
    let member = pick_member(console, query).await?;
    let outcome = console.delete_member(&member.id).await?;
    print_notices(&outcome.notices);
    println!("Member '{}' removed", member.name);
    Ok(())
}

// Inventory

pub async fn product_list(console: &Console, low_only: bool) -> Result<()> {
    let outcome = console.load_inventory().await?;
    print_notices(&outcome.notices);
    let inventory = outcome.value;

    let mut grouped: HashMap<&str, Vec<&Product>> = HashMap::new();
    for product in &inventory.products {
        if low_only && !rules::is_low_stock(product) {
            continue;
        }
        grouped.entry(product.category_id.as_str()).or_default().push(product);
    }

    println!("Products:");
    println!("---------");
    for category in &inventory.categories {
        let Some(products) = grouped.remove(category.id.as_str()) else {
            continue;
        };
        println!("{}:", category.name);
        for product in products {
            print_product(product);
        }
    }
    // Products whose category no longer exists.
    for products in grouped.into_values() {
        println!("(uncategorized):");
        for product in products {
            print_product(product);
        }
    }
    Ok(())
}

fn print_product(product: &Product) {
    let flag = if rules::is_low_stock(product) { " LOW" } else { "" };
    println!(
        "  {} | Stock: {} | Threshold: {}{} | Id: {}",
        product.name, product.stock, product.threshold, flag, product.id
    );
}

pub async fn product_add(
    console: &Console,
    name: &str,
    stock: i64,
    threshold: i64,
    category: Option<&str>,
) -> Result<()> {
    let category_id = match category {
        Some(query) => Some(pick_category(console, query).await?.id),
        None => None,
    };
    let outcome = console
        .add_product(name, stock, threshold, category_id.as_deref())
        .await?;
    print_notices(&outcome.notices);
    println!("Product '{}' added (id {})", outcome.value.name, outcome.value.id);
    Ok(())
}

pub async fn product_edit(console: &Console, query: &str, patch: ProductPatch) -> Result<()> {
    let product = pick_product(console, query).await?;
    let outcome = console.edit_product(&product.id, patch).await?;
    print_notices(&outcome.notices);
    println!("Product '{}' updated", product.name);
    Ok(())
}

pub async fn product_delete(console: &Console, query: &str) -> Result<()> {
    let product = pick_product(console, query).await?;
    let outcome = console.delete_product(&product.id).await?;
    print_notices(&outcome.notices);
    println!("Product '{}' deleted", product.name);
    Ok(())
}

pub async fn outbound(console: &Console, query: &str, quantity: i64) -> Result<()> {
    let product = pick_product(console, query).await?;
    let outcome = console.outbound(&product.id, quantity).await?;
    println!(
        "{}: {} -> {} (-{})",
        product.name, outcome.value.before, outcome.value.after, quantity
    );
    print_notices(&outcome.notices);
    Ok(())
}

pub async fn inbound(console: &Console, query: &str, quantity: i64) -> Result<()> {
    let product = pick_product(console, query).await?;
    let outcome = console.inbound(&product.id, quantity).await?;
    println!(
        "{}: {} -> {} (+{})",
        product.name, outcome.value.before, outcome.value.after, quantity
    );
    print_notices(&outcome.notices);
    Ok(())
}

pub async fn product_move(console: &Console, product: &str, category: &str) -> Result<()> {
    let product = pick_product(console, product).await?;
    let category = pick_category(console, category).await?;
    let outcome = console.move_product(&product.id, &category.id).await?;
    print_notices(&outcome.notices);
    println!("Product '{}' moved to '{}'", product.name, outcome.value.name);
    Ok(())
}

// Categories

pub async fn category_list(console: &Console) -> Result<()> {
    let outcome = console.load_inventory().await?;
    print_notices(&outcome.notices);
    let inventory = outcome.value;

    println!("Categories:");
    println!("-----------");
    for category in &inventory.categories {
        let count = inventory
            .products
            .iter()
            .filter(|p| p.category_id == category.id)
            .count();
        let marker = if category.is_default() { " (default)" } else { "" };
        println!(
            "{}{} | Products: {} | Id: {}",
            category.name, marker, count, category.id
        );
    }
    Ok(())
}

pub async fn category_add(console: &Console, name: &str) -> Result<()> {
    let outcome = console.add_category(name).await?;
    print_notices(&outcome.notices);
    println!("Category '{}' added (id {})", outcome.value.name, outcome.value.id);
    Ok(())
}

pub async fn category_rename(console: &Console, query: &str, name: &str) -> Result<()> {
    let category = pick_category(console, query).await?;
    let outcome = console.rename_category(&category.id, name).await?;
    print_notices(&outcome.notices);
    println!("Category '{}' renamed to '{}'", category.name, name.trim());
    Ok(())
}

pub async fn category_delete(console: &Console, query: &str) -> Result<()> {
    let category = pick_category(console, query).await?;
    let outcome = console.delete_category(&category.id).await?;
    print_notices(&outcome.notices);
    println!(
        "Category '{}' deleted; its products moved to the default category",
        category.name
    );
    Ok(())
}

// Config

fn is_secret(key: &str) -> bool {
    key == config::KEY_SUPABASE_KEY
}

pub fn set_config(store: &LocalStore, key: &str, value: &str) -> Result<()> {
    if let Err(e) = config::validate_value(key, value) {
        bail!(e);
    }
    store.set_config(key, value)?;
    println!("Config '{}' set", key);
    Ok(())
}

pub fn get_config(store: &LocalStore, key: &str) -> Result<()> {
    match store.get_config(key)? {
        Some(value) if is_secret(key) => println!("{} = {}", key, config::mask(&value)),
        Some(value) => println!("{} = {}", key, value),
        None => println!("Config '{}' not set", key),
    }
    Ok(())
}

pub fn list_configs(store: &LocalStore) -> Result<()> {
    let configs = store.get_all_configs()?;
    println!("Configs:");
    println!("--------");
    for item in &configs {
        let value = if is_secret(&item.key_name) {
            config::mask(&item.value)
        } else {
            item.value.clone()
        };
        println!("{} = {} | Updated: {}", item.key_name, value, item.updated_at);
    }
    Ok(())
}

pub fn delete_config(store: &LocalStore, key: &str) -> Result<()> {
    if store.delete_config(key)? {
        println!("Config '{}' deleted", key);
    } else {
        println!("Config '{}' not set", key);
    }
    Ok(())
}

// Backend and diagnostics

pub fn backend(console: &Console) -> Result<()> {
    let ctx = console.context();
    println!("Backend: {}", ctx.kind());
    println!("Reason: {}", ctx.reason);
    if ctx.is_remote() {
        println!("Write policy: {}", ctx.write_policy);
    }
    let queued = outbox::pending(&ctx.local)?.len();
    if queued > 0 {
        println!("Outbox: {} queued write(s)", queued);
    }
    Ok(())
}

/// What to tell the user about a PostgREST / Postgres error code.
pub fn hint_for(code: Option<&str>) -> Option<&'static str> {
    match code? {
        "PGRST116" | "42P01" | "PGRST205" => {
            Some("the table does not exist; create it with the SQL from `opsdesk schema`")
        }
        "42501" => Some("permission denied; check the row-level security policies for the anon key"),
        "PGRST301" => Some("the API key was rejected; check supabase_key"),
        _ => None,
    }
}

/// Probes every hosted table, in `TABLES` order.
pub async fn check_tables(remote: &RemoteStore) -> Vec<(&'static str, Result<(), StorageError>)> {
    let mut results = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        results.push((table, remote.probe(table).await));
    }
    results
}

pub async fn doctor(settings: &Settings) -> Result<()> {
    println!("Remote configuration:");
    let url = settings.supabase_url.as_deref();
    let key = settings.supabase_key.as_deref();
    if let Err(reason) = has_valid_remote_config(url, key) {
        println!("  ✗ {}", reason);
        println!(
            "  Set {} and {} with `opsdesk set`, or SUPABASE_URL and SUPABASE_ANON_KEY in .env.local",
            config::KEY_SUPABASE_URL,
            config::KEY_SUPABASE_KEY
        );
        return Ok(());
    }
    let (url, key) = (url.unwrap_or_default(), key.unwrap_or_default());
    println!("  ✓ URL: {}", url);
    println!("  ✓ Key: {}", config::mask(key));
    if settings.force_local {
        println!("  (--local is set; this session would not use the remote backend)");
    }

    let remote = RemoteStore::new(url, key, settings.request_timeout)
        .context("Failed to build HTTP client")?;
    println!("Tables:");
    let mut failures = 0;
    for (table, result) in check_tables(&remote).await {
        match result {
            Ok(()) => println!("  ✓ {}", table),
            Err(e) => {
                failures += 1;
                println!("  ✗ {}: {}", table, e);
                if let Some(hint) = hint_for(e.code()) {
                    println!("    hint: {}", hint);
                }
            }
        }
    }

    if failures == 0 {
        println!("All {} tables reachable", TABLES.len());
    } else {
        println!("{} of {} tables failed", failures, TABLES.len());
    }
    Ok(())
}

// Outbox

pub fn outbox_list(store: &LocalStore) -> Result<()> {
    let entries = outbox::pending(store)?;
    println!("Outbox:");
    println!("-------");
    for entry in &entries {
        print!(
            "#{} {} | Queued: {} | Attempts: {}",
            entry.id,
            entry.describe(),
            entry.created_at,
            entry.attempts
        );
        match &entry.last_error {
            Some(error) => println!(" | Last error: {}", error),
            None => println!(),
        }
    }
    if entries.is_empty() {
        println!("(empty)");
    }
    Ok(())
}

pub async fn outbox_replay(console: &Console) -> Result<()> {
    let ctx = console.context();
    if !ctx.is_remote() {
        bail!(
            "Replay needs the remote backend, but this session is local ({})",
            ctx.reason
        );
    }
    let target: &dyn Storage = ctx.primary.as_ref();
    let report = outbox::replay(&ctx.local, target).await?;
    println!("Replayed {} write(s), {} still queued", report.replayed, report.remaining);
    if let Some(error) = report.error {
        eprintln!("Stopped at first failure: {}", error);
    }
    Ok(())
}

pub fn outbox_clear(store: &LocalStore) -> Result<()> {
    let dropped = outbox::clear(store)?;
    println!("Dropped {} queued write(s)", dropped);
    Ok(())
}

pub fn completions(shell: &str) -> Result<()> {
    use clap_complete::{generate, Shell};
    let shell_enum = match shell.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "elvish" => Shell::Elvish,
        "powershell" => Shell::PowerShell,
        other => bail!("Unsupported shell: {}", other),
    };
    let mut cmd = Cli::command();
    generate(shell_enum, &mut cmd, "opsdesk", &mut std::io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fake;
    use std::time::Duration;

    #[test]
    fn hints_cover_missing_tables_and_permissions() {
        assert!(hint_for(Some("42P01")).unwrap().contains("schema"));
        assert!(hint_for(Some("PGRST116")).is_some());
        assert!(hint_for(Some("42501")).unwrap().contains("permission"));
        assert_eq!(hint_for(Some("23505")), None);
        assert_eq!(hint_for(None), None);
    }

    #[tokio::test]
    async fn check_tables_reports_each_table() {
        let (base, db) = fake::start().await;
        let remote = RemoteStore::new(&base, "test-anon-key-0123456789", Duration::from_secs(5))
            .unwrap();

        let healthy = check_tables(&remote).await;
        assert_eq!(healthy.len(), TABLES.len());
        assert!(healthy.iter().all(|(_, r)| r.is_ok()));

        db.lock().unwrap().fail_with = Some("42P01".to_string());
        let broken = check_tables(&remote).await;
        for (_, result) in &broken {
            let err = result.as_ref().unwrap_err();
            assert_eq!(err.code(), Some("42P01"));
        }
    }

    #[test]
    fn set_config_rejects_unknown_keys() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(set_config(&store, "theme", "dark").is_err());
        set_config(&store, config::KEY_WRITE_POLICY, "strict").unwrap();
        assert_eq!(
            store.get_config(config::KEY_WRITE_POLICY).unwrap().as_deref(),
            Some("strict")
        );
    }
}
