use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{BackendKind, Storage};
use crate::error::{StorageError, StorageResult};
use crate::models::{
    Category, CategoryPatch, ConfigItem, Member, MemberPatch, NewCategory, NewMember, NewProduct,
    NewTask, Product, ProductPatch, Record, Task, TaskPatch, DEFAULT_CATEGORY_NAME,
};

/// Row of the outbox journal, with the operation still in its JSON form.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub op: String,
    pub created_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Local key-value store: one JSON array per entity type, kept in SQLite.
///
/// The same file also holds the `configs` table and the outbox journal.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn default_path() -> PathBuf {
        let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home_dir).join(".opsdesk.db")
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        log::debug!("Opening local store at {}", path.display());
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS configs (
                key_name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                op TEXT NOT NULL,
                created_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            [],
        )?;

        Ok(LocalStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn read_all<T: Record>(&self) -> StorageResult<Vec<T>> {
        let conn = self.lock()?;
        read_key(&conn, T::KEY)
    }

    fn insert<T: Record>(&self, build: impl FnOnce(String) -> T) -> StorageResult<T> {
        let conn = self.lock()?;
        let mut records: Vec<T> = read_key(&conn, T::KEY)?;
        let record = build(next_id(&records));
        records.push(record.clone());
        write_key(&conn, T::KEY, &records)?;
        log::debug!("Added {} record {}", T::KEY, record.id());
        Ok(record)
    }

    fn modify<T: Record>(&self, id: &str, apply: impl FnOnce(&mut T)) -> StorageResult<()> {
        let conn = self.lock()?;
        let mut records: Vec<T> = read_key(&conn, T::KEY)?;
        match records.iter_mut().find(|r| r.id() == id) {
            Some(record) => {
                apply(record);
                write_key(&conn, T::KEY, &records)
            }
            None => {
                log::debug!("No {} record with id {}, update ignored", T::KEY, id);
                Ok(())
            }
        }
    }

    fn remove<T: Record>(&self, id: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        let mut records: Vec<T> = read_key(&conn, T::KEY)?;
        records.retain(|r| r.id() != id);
        write_key(&conn, T::KEY, &records)
    }

    // Config table

    pub fn set_config(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO configs (key_name, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(key_name) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            [key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM configs WHERE key_name = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_all_configs(&self) -> StorageResult<Vec<ConfigItem>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key_name, value, updated_at FROM configs ORDER BY key_name")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigItem {
                key_name: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;

        let mut configs = Vec::new();
        for row in rows {
            configs.push(row?);
        }
        Ok(configs)
    }

    /// Returns whether a value was removed.
    pub fn delete_config(&self, key: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let rows_affected = conn.execute("DELETE FROM configs WHERE key_name = ?1", [key])?;
        Ok(rows_affected > 0)
    }

    // Outbox journal

    pub fn push_outbox(&self, op: &str) -> StorageResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO outbox (op, created_at) VALUES (?1, ?2)",
            params![op, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_outbox(&self) -> StorageResult<Vec<OutboxRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, op, created_at, attempts, last_error FROM outbox ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OutboxRow {
                id: row.get(0)?,
                op: row.get(1)?,
                created_at: row.get(2)?,
                attempts: row.get(3)?,
                last_error: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn mark_outbox_failed(&self, id: i64, error: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    pub fn remove_outbox(&self, id: i64) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn clear_outbox(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM outbox", [])?)
    }
}

fn read_key<T: DeserializeOwned>(conn: &Connection, key: &str) -> StorageResult<Vec<T>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;

    match value {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn write_key<T: Serialize>(conn: &Connection, key: &str, records: &[T]) -> StorageResult<()> {
    let json = serde_json::to_string(records)?;
    conn.execute(
        "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, json.as_str()],
    )?;
    Ok(())
}

/// Millisecond timestamp id, bumped past any existing numeric id.
fn next_id<T: Record>(records: &[T]) -> String {
    let now = Utc::now().timestamp_millis();
    let highest = records
        .iter()
        .filter_map(|r| r.id().parse::<i64>().ok())
        .max()
        .unwrap_or(i64::MIN);
    now.max(highest.saturating_add(1)).to_string()
}

#[async_trait]
impl Storage for LocalStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn ping(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn get_tasks(&self) -> StorageResult<Vec<Task>> {
        self.read_all()
    }

    async fn add_task(&self, task: NewTask) -> StorageResult<Task> {
        self.insert(|id| Task {
            id,
            title: task.title,
            description: task.description,
            assignee: task.assignee,
            due_date: task.due_date,
            status: task.status,
            created_at: Utc::now(),
        })
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> StorageResult<()> {
        self.modify(id, |task: &mut Task| patch.apply_to(task))
    }

    async fn delete_task(&self, id: &str) -> StorageResult<()> {
        self.remove::<Task>(id)
    }

    async fn get_products(&self) -> StorageResult<Vec<Product>> {
        self.read_all()
    }

    async fn add_product(&self, product: NewProduct) -> StorageResult<Product> {
        self.insert(|id| Product {
            id,
            name: product.name,
            stock: product.stock,
            threshold: product.threshold,
            category_id: product.category_id,
            created_at: Utc::now(),
        })
    }

    async fn update_product(&self, id: &str, patch: ProductPatch) -> StorageResult<()> {
        self.modify(id, |product: &mut Product| patch.apply_to(product))
    }

    async fn delete_product(&self, id: &str) -> StorageResult<()> {
        self.remove::<Product>(id)
    }

    async fn get_categories(&self) -> StorageResult<Vec<Category>> {
        self.read_all()
    }

    async fn add_category(&self, category: NewCategory) -> StorageResult<Category> {
        self.insert(|id| Category {
            id,
            name: category.name,
            created_at: Utc::now(),
        })
    }

    async fn update_category(&self, id: &str, patch: CategoryPatch) -> StorageResult<()> {
        self.modify(id, |category: &mut Category| patch.apply_to(category))
    }

    async fn delete_category(&self, id: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        let mut categories: Vec<Category> = read_key(&conn, Category::KEY)?;

        if let Some(default) = categories.iter().find(|c| c.is_default()) {
            let mut products: Vec<Product> = read_key(&conn, Product::KEY)?;
            let mut moved = 0;
            for product in products.iter_mut().filter(|p| p.category_id == id) {
                product.category_id = default.id.clone();
                moved += 1;
            }
            write_key(&conn, Product::KEY, &products)?;
            log::debug!("Moved {} products from category {} to default", moved, id);
        }

        categories.retain(|c| c.id != id);
        write_key(&conn, Category::KEY, &categories)
    }

    async fn get_members(&self) -> StorageResult<Vec<Member>> {
        self.read_all()
    }

    async fn add_member(&self, member: NewMember) -> StorageResult<Member> {
        self.insert(|id| Member {
            id,
            name: member.name,
            created_at: Utc::now(),
        })
    }

    async fn update_member(&self, id: &str, patch: MemberPatch) -> StorageResult<()> {
        self.modify(id, |member: &mut Member| patch.apply_to(member))
    }

    async fn delete_member(&self, id: &str) -> StorageResult<()> {
        self.remove::<Member>(id)
    }

    async fn initialize_default_category(&self) -> StorageResult<()> {
        let categories: Vec<Category> = self.read_all()?;
        if !categories.iter().any(|c| c.is_default()) {
            log::info!("Creating default category '{}'", DEFAULT_CATEGORY_NAME);
            self.add_category(NewCategory {
                name: DEFAULT_CATEGORY_NAME.to_string(),
            })
            .await?;
        }
        Ok(())
    }
}
