use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{BackendKind, Storage};
use crate::error::{StorageError, StorageResult};
use crate::models::{
    Category, CategoryPatch, Member, MemberPatch, NewCategory, NewMember, NewProduct, NewTask,
    Product, ProductPatch, Task, TaskPatch, TaskStatus, DEFAULT_CATEGORY_NAME,
};

const TASKS: &str = "tasks";
const MEMBERS: &str = "members";
const PRODUCTS: &str = "inventory_items";
const CATEGORIES: &str = "categories";

/// Hosted tables, in the order `doctor` checks them.
pub const TABLES: [&str; 4] = [MEMBERS, TASKS, PRODUCTS, CATEGORIES];

/// DDL for the hosted tables, with open row-level policies for the anon key.
pub const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS members (
  id BIGSERIAL PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS tasks (
  id BIGSERIAL PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT,
  assignee TEXT NOT NULL,
  due_date DATE NOT NULL,
  status TEXT DEFAULT 'pending' CHECK (status IN ('pending', 'completed', 'overdue')),
  created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS inventory_items (
  id BIGSERIAL PRIMARY KEY,
  name TEXT NOT NULL,
  stock INTEGER DEFAULT 0,
  threshold INTEGER DEFAULT 10,
  category_id TEXT DEFAULT 'default',
  created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS categories (
  id BIGSERIAL PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
);

ALTER TABLE members ENABLE ROW LEVEL SECURITY;
ALTER TABLE tasks ENABLE ROW LEVEL SECURITY;
ALTER TABLE inventory_items ENABLE ROW LEVEL SECURITY;
ALTER TABLE categories ENABLE ROW LEVEL SECURITY;

CREATE POLICY \"Allow anonymous access\" ON members FOR ALL USING (true);
CREATE POLICY \"Allow anonymous access\" ON tasks FOR ALL USING (true);
CREATE POLICY \"Allow anonymous access\" ON inventory_items FOR ALL USING (true);
CREATE POLICY \"Allow anonymous access\" ON categories FOR ALL USING (true);
";

/// Hosted relational backend reached through its PostgREST endpoint.
pub struct RemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

// Ids come back as BIGSERIAL numbers; older rows may carry text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    fn into_string(self) -> String {
        match self {
            RowId::Int(n) => n.to_string(),
            RowId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: RowId,
    title: String,
    #[serde(default)]
    description: Option<String>,
    assignee: String,
    due_date: NaiveDate,
    status: TaskStatus,
    created_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id.into_string(),
            title: row.title,
            description: row.description.filter(|d| !d.is_empty()),
            assignee: row.assignee,
            due_date: row.due_date,
            status: row.status,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductRow {
    id: RowId,
    name: String,
    stock: i64,
    threshold: i64,
    #[serde(default)]
    category_id: Option<RowId>,
    created_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id.into_string(),
            name: row.name,
            stock: row.stock,
            threshold: row.threshold,
            category_id: row.category_id.map(RowId::into_string).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NamedRow {
    id: RowId,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<NamedRow> for Category {
    fn from(row: NamedRow) -> Self {
        Category {
            id: row.id.into_string(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

impl From<NamedRow> for Member {
    fn from(row: NamedRow) -> Self {
        Member {
            id: row.id.into_string(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

// Write bodies use the fixed column names of the hosted schema.

#[derive(Debug, Default, Serialize)]
struct TaskColumns<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignee: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<TaskStatus>,
}

#[derive(Debug, Default, Serialize)]
struct ProductColumns<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stock: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category_id: Option<&'a str>,
}

#[derive(Debug, Default, Serialize)]
struct NameColumn<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<String>,
    message: Option<String>,
}

impl RemoteStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> StorageResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(RemoteStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, table: &str, request: RequestBuilder) -> StorageResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ApiError> = serde_json::from_str(&body).ok();
        let (code, message) = match parsed {
            Some(err) => (err.code, err.message.unwrap_or_else(|| body.clone())),
            None => (None, body),
        };
        log::warn!("{} request failed with {}: {}", table, status, message);
        Err(StorageError::Status {
            table: table.to_string(),
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn select<R: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> StorageResult<Vec<R>> {
        let request = self
            .request(Method::GET, table)
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .query(filters);
        let response = self.send(table, request).await?;
        Ok(response.json().await?)
    }

    async fn insert<B: Serialize, R: DeserializeOwned>(
        &self,
        table: &'static str,
        body: &B,
    ) -> StorageResult<R> {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&[body]);
        let response = self.send(table, request).await?;
        let mut rows: Vec<R> = response.json().await?;
        if rows.is_empty() {
            return Err(StorageError::EmptyInsert(table));
        }
        Ok(rows.swap_remove(0))
    }

    async fn patch<B: Serialize>(
        &self,
        table: &str,
        column: &str,
        value: &str,
        body: &B,
    ) -> StorageResult<()> {
        let request = self
            .request(Method::PATCH, table)
            .query(&[(column, format!("eq.{}", value))])
            .json(body);
        self.send(table, request).await?;
        Ok(())
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> StorageResult<()> {
        let request = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{}", id))]);
        self.send(table, request).await?;
        Ok(())
    }

    /// Reads at most one id from `table`; used by `ping` and `doctor`.
    pub async fn probe(&self, table: &str) -> StorageResult<()> {
        let request = self
            .request(Method::GET, table)
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(table, request).await?;
        Ok(())
    }

    async fn find_default_category(&self) -> StorageResult<Option<Category>> {
        let filters = [
            ("name", format!("eq.{}", DEFAULT_CATEGORY_NAME)),
            ("limit", "1".to_string()),
        ];
        let rows: Vec<NamedRow> = self.select(CATEGORIES, &filters).await?;
        Ok(rows.into_iter().next().map(Category::from))
    }
}

#[async_trait]
impl Storage for RemoteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn ping(&self) -> StorageResult<()> {
        self.probe(MEMBERS).await
    }

    async fn get_tasks(&self) -> StorageResult<Vec<Task>> {
        let rows: Vec<TaskRow> = self.select(TASKS, &[]).await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn add_task(&self, task: NewTask) -> StorageResult<Task> {
        let body = TaskColumns {
            title: Some(&task.title),
            description: task.description.as_deref(),
            assignee: Some(&task.assignee),
            due_date: Some(task.due_date),
            status: Some(task.status),
        };
        let row: TaskRow = self.insert(TASKS, &body).await?;
        Ok(row.into())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> StorageResult<()> {
        let body = TaskColumns {
            title: patch.title.as_deref(),
            description: patch.description.as_deref(),
            assignee: patch.assignee.as_deref(),
            due_date: patch.due_date,
            status: patch.status,
        };
        self.patch(TASKS, "id", id, &body).await
    }

    async fn delete_task(&self, id: &str) -> StorageResult<()> {
        self.delete_by_id(TASKS, id).await
    }

    async fn get_products(&self) -> StorageResult<Vec<Product>> {
        let rows: Vec<ProductRow> = self.select(PRODUCTS, &[]).await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn add_product(&self, product: NewProduct) -> StorageResult<Product> {
        let body = ProductColumns {
            name: Some(&product.name),
            stock: Some(product.stock),
            threshold: Some(product.threshold),
            category_id: Some(&product.category_id),
        };
        let row: ProductRow = self.insert(PRODUCTS, &body).await?;
        Ok(row.into())
    }

    async fn update_product(&self, id: &str, patch: ProductPatch) -> StorageResult<()> {
        let body = ProductColumns {
            name: patch.name.as_deref(),
            stock: patch.stock,
            threshold: patch.threshold,
            category_id: patch.category_id.as_deref(),
        };
        self.patch(PRODUCTS, "id", id, &body).await
    }

    async fn delete_product(&self, id: &str) -> StorageResult<()> {
        self.delete_by_id(PRODUCTS, id).await
    }

    async fn get_categories(&self) -> StorageResult<Vec<Category>> {
        let rows: Vec<NamedRow> = self.select(CATEGORIES, &[]).await?;
        Ok(rows.into_iter().map(Category::from).collect())
    }

    async fn add_category(&self, category: NewCategory) -> StorageResult<Category> {
        let body = NameColumn {
            name: Some(&category.name),
        };
        let row: NamedRow = self.insert(CATEGORIES, &body).await?;
        Ok(row.into())
    }

    async fn update_category(&self, id: &str, patch: CategoryPatch) -> StorageResult<()> {
        let body = NameColumn {
            name: patch.name.as_deref(),
        };
        self.patch(CATEGORIES, "id", id, &body).await
    }

    async fn delete_category(&self, id: &str) -> StorageResult<()> {
        if let Some(default) = self.find_default_category().await? {
            let body = ProductColumns {
                category_id: Some(&default.id),
                ..Default::default()
            };
            self.patch(PRODUCTS, "category_id", id, &body).await?;
        }
        self.delete_by_id(CATEGORIES, id).await
    }

    async fn get_members(&self) -> StorageResult<Vec<Member>> {
        let rows: Vec<NamedRow> = self.select(MEMBERS, &[]).await?;
        Ok(rows.into_iter().map(Member::from).collect())
    }

    async fn add_member(&self, member: NewMember) -> StorageResult<Member> {
        let body = NameColumn {
            name: Some(&member.name),
        };
        let row: NamedRow = self.insert(MEMBERS, &body).await?;
        Ok(row.into())
    }

    async fn update_member(&self, id: &str, patch: MemberPatch) -> StorageResult<()> {
        let body = NameColumn {
            name: patch.name.as_deref(),
        };
        self.patch(MEMBERS, "id", id, &body).await
    }

    async fn delete_member(&self, id: &str) -> StorageResult<()> {
        self.delete_by_id(MEMBERS, id).await
    }

    async fn initialize_default_category(&self) -> StorageResult<()> {
        if self.find_default_category().await?.is_none() {
            log::info!("Creating default category '{}' remotely", DEFAULT_CATEGORY_NAME);
            self.add_category(NewCategory {
                name: DEFAULT_CATEGORY_NAME.to_string(),
            })
            .await?;
        }
        Ok(())
    }
}

/// In-process stand-in for a PostgREST endpoint, shared with other modules' tests.
#[cfg(test)]
pub(crate) mod fake {
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeDb {
        pub tables: HashMap<String, Vec<Value>>,
        pub next_id: i64,
        pub seq: i64,
        /// When set, every request answers 500 with this Postgres code.
        pub fail_with: Option<String>,
    }

    pub type Shared = Arc<Mutex<FakeDb>>;

    const RESERVED: [&str; 3] = ["select", "order", "limit"];

    fn as_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn matches(row: &Value, params: &HashMap<String, String>) -> bool {
        params
            .iter()
            .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
            .all(|(k, v)| {
                let wanted = v.strip_prefix("eq.").unwrap_or(v);
                row.get(k).map(as_text).as_deref() == Some(wanted)
            })
    }

    fn guard(db: &FakeDb, headers: &HeaderMap) -> Option<Response> {
        if !headers.contains_key("apikey") {
            return Some(StatusCode::UNAUTHORIZED.into_response());
        }
        db.fail_with.as_ref().map(|code| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "code": code, "message": "simulated failure" })),
            )
                .into_response()
        })
    }

    async fn select(
        State(db): State<Shared>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        let db = db.lock().unwrap();
        if let Some(rejection) = guard(&db, &headers) {
            return rejection;
        }
        let mut rows: Vec<Value> = db
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter(|r| matches(r, &params)).cloned().collect())
            .unwrap_or_default();
        if params.get("order").map(String::as_str) == Some("created_at.desc") {
            rows.sort_by_key(|r| std::cmp::Reverse(r["_seq"].as_i64().unwrap_or(0)));
        }
        if let Some(limit) = params.get("limit").and_then(|l| l.parse::<usize>().ok()) {
            rows.truncate(limit);
        }
        Json(Value::Array(rows)).into_response()
    }

    async fn insert(
        State(db): State<Shared>,
        Path(table): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Vec<Map<String, Value>>>,
    ) -> Response {
        let mut db = db.lock().unwrap();
        if let Some(rejection) = guard(&db, &headers) {
            return rejection;
        }
        let mut inserted = Vec::new();
        for mut row in body {
            db.next_id += 1;
            db.seq += 1;
            row.insert("id".to_string(), json!(db.next_id));
            row.insert("_seq".to_string(), json!(db.seq));
            row.insert(
                "created_at".to_string(),
                json!(format!("2024-05-01T08:00:{:02}.000000+00:00", db.seq % 60)),
            );
            if table == "inventory_items" && !row.contains_key("category_id") {
                row.insert("category_id".to_string(), json!("default"));
            }
            inserted.push(Value::Object(row));
        }
        db.tables
            .entry(table)
            .or_default()
            .extend(inserted.iter().cloned());
        (StatusCode::CREATED, Json(Value::Array(inserted))).into_response()
    }

    async fn update(
        State(db): State<Shared>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<Map<String, Value>>,
    ) -> Response {
        let mut db = db.lock().unwrap();
        if let Some(rejection) = guard(&db, &headers) {
            return rejection;
        }
        if let Some(rows) = db.tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|r| matches(r, &params)) {
                if let Value::Object(fields) = row {
                    for (k, v) in &body {
                        fields.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        StatusCode::NO_CONTENT.into_response()
    }

    async fn remove(
        State(db): State<Shared>,
        Path(table): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        let mut db = db.lock().unwrap();
        if let Some(rejection) = guard(&db, &headers) {
            return rejection;
        }
        if let Some(rows) = db.tables.get_mut(&table) {
            rows.retain(|r| !matches(r, &params));
        }
        StatusCode::NO_CONTENT.into_response()
    }

    /// Bind to port 0 and return the base URL plus a handle on the tables.
    pub async fn start() -> (String, Shared) {
        let db: Shared = Arc::new(Mutex::new(FakeDb::default()));
        let app = Router::new()
            .route(
                "/rest/v1/:table",
                get(select).post(insert).patch(update).delete(remove),
            )
            .with_state(db.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn remote() -> (RemoteStore, fake::Shared) {
        let (base, db) = fake::start().await;
        let store = RemoteStore::new(&base, "test-anon-key-0123456789", Duration::from_secs(5))
            .unwrap();
        (store, db)
    }

    #[tokio::test]
    async fn test_add_task_uses_hosted_column_names() {
        let (store, db) = remote().await;

        let task = store
            .add_task(NewTask {
                title: "Count stock".to_string(),
                description: None,
                assignee: "Ana".to_string(),
                due_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                status: TaskStatus::Pending,
            })
            .await
            .unwrap();

        assert_eq!(task.id, "1");
        assert_eq!(task.title, "Count stock");
        let db = db.lock().unwrap();
        let row = &db.tables["tasks"][0];
        assert_eq!(row["due_date"], "2024-06-01");
        assert_eq!(row["status"], "pending");
        assert!(row.get("description").is_none());
    }

    #[tokio::test]
    async fn test_reads_newest_first() {
        let (store, _db) = remote().await;
        store.add_member(NewMember { name: "First".to_string() }).await.unwrap();
        store.add_member(NewMember { name: "Second".to_string() }).await.unwrap();

        let members = store.get_members().await.unwrap();
        let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Second", "First"]);
    }

    #[tokio::test]
    async fn test_update_sends_only_patched_columns() {
        let (store, _db) = remote().await;
        let product = store
            .add_product(NewProduct {
                name: "Widget".to_string(),
                stock: 10,
                threshold: 5,
                category_id: "1".to_string(),
            })
            .await
            .unwrap();

        store
            .update_product(&product.id, ProductPatch::stock(4))
            .await
            .unwrap();

        let products = store.get_products().await.unwrap();
        assert_eq!(products[0].stock, 4);
        assert_eq!(products[0].threshold, 5);
        assert_eq!(products[0].category_id, "1");
    }

    #[tokio::test]
    async fn test_delete_category_reassigns_products_first() {
        let (store, _db) = remote().await;
        store.initialize_default_category().await.unwrap();
        store.initialize_default_category().await.unwrap();

        let categories = store.get_categories().await.unwrap();
        assert_eq!(categories.len(), 1);
        let default_id = categories[0].id.clone();

        let tools = store
            .add_category(NewCategory { name: "Tools".to_string() })
            .await
            .unwrap();
        store
            .add_product(NewProduct {
                name: "Hammer".to_string(),
                stock: 3,
                threshold: 1,
                category_id: tools.id.clone(),
            })
            .await
            .unwrap();

        store.delete_category(&tools.id).await.unwrap();

        let products = store.get_products().await.unwrap();
        assert_eq!(products[0].category_id, default_id);
        let categories = store.get_categories().await.unwrap();
        assert!(categories.iter().all(|c| c.id != tools.id));
    }

    #[tokio::test]
    async fn test_server_errors_surface_code() {
        let (store, db) = remote().await;
        db.lock().unwrap().fail_with = Some("42P01".to_string());

        let err = store.get_tasks().await.unwrap_err();
        assert_eq!(err.code(), Some("42P01"));
        assert!(store.ping().await.is_err());
    }
}
