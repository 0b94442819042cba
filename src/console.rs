//! User actions shared by the CLI and the TUI.
//!
//! Each method loads what it needs from the session's primary backend, runs
//! the pure checks in [`crate::rules`], and routes the resulting write
//! through the session's write policy. Under `LocalFallback` a failing remote
//! read is served from the local store so the write can still be queued.

use chrono::{Local, NaiveDate};
use std::fmt;
use std::future::Future;
use thiserror::Error;

use crate::config::WritePolicy;
use crate::error::{StorageError, StorageResult};
use crate::models::{
    Category, CategoryPatch, DashboardSummary, Member, MemberPatch, NewCategory, NewMember,
    NewProduct, NewTask, Product, ProductPatch, Task, TaskPatch, TaskStatus, DEFAULT_CATEGORY_NAME,
};
use crate::outbox::{self, Applied, WriteOp};
use crate::rules::{self, RuleError, StockChange};
use crate::storage::{Storage, StorageContext};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No {kind} with id {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Only pending tasks can be completed (this one is {0})")]
    NotPending(TaskStatus),

    #[error("Nothing to change")]
    EmptyPatch,

    #[error("Backend returned an unexpected result for {0}")]
    UnexpectedResult(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// A message for the user produced alongside an action's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: Level,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Notice {
            level: Level::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Notice {
            level: Level::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Notice {
            level: Level::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Level::Info => write!(f, "{}", self.message),
            Level::Warning => write!(f, "warning: {}", self.message),
            Level::Error => write!(f, "error: {}", self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub notices: Vec<Notice>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Outcome {
            value,
            notices: Vec::new(),
        }
    }

    pub fn with_notice(mut self, notice: Notice) -> Self {
        self.notices.push(notice);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            notices: self.notices,
        }
    }

    fn try_map<U>(
        self,
        f: impl FnOnce(T) -> ConsoleResult<U>,
    ) -> ConsoleResult<Outcome<U>> {
        Ok(Outcome {
            value: f(self.value)?,
            notices: self.notices,
        })
    }
}

/// Products plus the categories they are grouped under.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub products: Vec<Product>,
    pub categories: Vec<Category>,
}

impl Inventory {
    pub fn category_name(&self, id: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.name.as_str())
    }

    pub fn default_category(&self) -> Option<&Category> {
        self.categories.iter().find(|c| c.is_default())
    }
}

pub struct Console {
    ctx: StorageContext,
}

fn not_found(kind: &'static str, id: &str) -> ConsoleError {
    ConsoleError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn low_stock_notice(product: &Product, change: &StockChange) -> Notice {
    Notice::warning(format!(
        "{} is low on stock: {} left (threshold {})",
        product.name, change.after, product.threshold
    ))
}

impl Console {
    pub fn new(ctx: StorageContext) -> Self {
        Console { ctx }
    }

    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    fn falls_back(&self) -> bool {
        self.ctx.is_remote() && self.ctx.write_policy == WritePolicy::LocalFallback
    }

    /// Awaits `primary`; if that fails and the session falls back, awaits
    /// `local` instead and says so in a notice.
    async fn read<T>(
        &self,
        what: &str,
        primary: impl Future<Output = StorageResult<T>>,
        local: impl Future<Output = StorageResult<T>>,
    ) -> ConsoleResult<Outcome<T>> {
        let primary_err = match primary.await {
            Ok(value) => return Ok(Outcome::new(value)),
            Err(e) => e,
        };
        if !self.falls_back() {
            return Err(primary_err.into());
        }

        log::warn!("Remote read of {} failed, using local data: {}", what, primary_err);
        let value = local.await?;
        Ok(Outcome::new(value).with_notice(Notice::warning(format!(
            "Remote read of {} failed ({}). Using local data",
            what, primary_err
        ))))
    }

    async fn read_tasks(&self) -> ConsoleResult<Outcome<Vec<Task>>> {
        self.read("tasks", self.ctx.primary.get_tasks(), self.ctx.local.get_tasks())
            .await
    }

    async fn read_products(&self) -> ConsoleResult<Outcome<Vec<Product>>> {
        self.read(
            "products",
            self.ctx.primary.get_products(),
            self.ctx.local.get_products(),
        )
        .await
    }

    /// The local side also creates the default category, so a product added
    /// during an outage still has somewhere to go.
    async fn read_categories(&self) -> ConsoleResult<Outcome<Vec<Category>>> {
        let local = async {
            self.ctx.local.initialize_default_category().await?;
            self.ctx.local.get_categories().await
        };
        self.read("categories", self.ctx.primary.get_categories(), local)
            .await
    }

    /// Applies `op` to the primary backend. A remote failure under
    /// `LocalFallback` is applied locally and queued in the outbox instead.
    async fn write(&self, op: WriteOp) -> ConsoleResult<Outcome<Applied>> {
        let primary_err = match op.apply(self.ctx.primary.as_ref()).await {
            Ok(applied) => return Ok(Outcome::new(applied)),
            Err(e) => e,
        };

        if !self.falls_back() {
            return Err(primary_err.into());
        }

        log::warn!(
            "Remote write '{}' failed, applying locally: {}",
            op.describe(),
            primary_err
        );
        let applied = op.apply(self.ctx.local.as_ref()).await?;
        let entry = outbox::record(&self.ctx.local, &op)?;
        Ok(Outcome::new(applied).with_notice(Notice::warning(format!(
            "Remote write failed ({}). Saved locally and queued as outbox entry {}",
            primary_err, entry
        ))))
    }

    // Tasks

    /// Loads tasks, persisting any pending-to-overdue transitions first.
    /// A failed write-back is reported but the derived status is still shown.
    pub async fn load_tasks(&self) -> ConsoleResult<Outcome<Vec<Task>>> {
        let now = Local::now();
        let Outcome {
            value: mut tasks,
            notices,
        } = self.read_tasks().await?;
        // Write back to whichever store the tasks came from.
        let target: &dyn Storage = if notices.is_empty() {
            self.ctx.primary.as_ref()
        } else {
            self.ctx.local.as_ref()
        };
        let mut outcome = Outcome {
            value: (),
            notices,
        };

        for id in rules::overdue_transitions(&tasks, &now) {
            let patch = TaskPatch::status(TaskStatus::Overdue);
            if let Err(e) = target.update_task(&id, patch).await {
                log::warn!("Could not mark task {} overdue: {}", id, e);
                outcome = outcome.with_notice(Notice::warning(format!(
                    "Could not save overdue status for task {}: {}",
                    id, e
                )));
            }
        }
        for task in tasks.iter_mut() {
            task.status = rules::derive_status(task, &now);
        }

        Ok(outcome.map(|_| tasks))
    }

    async fn find_task(&self, id: &str) -> ConsoleResult<Task> {
        self.read_tasks()
            .await?
            .value
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| not_found("task", id))
    }

    pub async fn create_task(
        &self,
        title: &str,
        assignee: &str,
        due_date: NaiveDate,
        description: Option<String>,
    ) -> ConsoleResult<Outcome<Task>> {
        rules::check_new_task(title, assignee)?;
        let op = WriteOp::AddTask {
            task: NewTask {
                title: title.trim().to_string(),
                description: non_blank(description),
                assignee: assignee.trim().to_string(),
                due_date,
                status: TaskStatus::Pending,
            },
        };
        let describe = op.describe();
        self.write(op)
            .await?
            .try_map(|a| a.into_task().ok_or(ConsoleError::UnexpectedResult(describe)))
    }

    pub async fn complete_task(&self, id: &str) -> ConsoleResult<Outcome<()>> {
        let task = self.find_task(id).await?;
        if task.status != TaskStatus::Pending {
            return Err(ConsoleError::NotPending(task.status));
        }
        let op = WriteOp::UpdateTask {
            id: task.id,
            patch: TaskPatch::status(TaskStatus::Completed),
        };
        Ok(self.write(op).await?.map(|_| ()))
    }

    /// A blank description clears it.
    pub async fn edit_task(&self, id: &str, mut patch: TaskPatch) -> ConsoleResult<Outcome<()>> {
        patch.description = patch.description.map(|d| d.trim().to_string());
        if patch.is_empty() {
            return Err(ConsoleError::EmptyPatch);
        }
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(RuleError::MissingField("Title").into());
        }
        if patch.assignee.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(RuleError::MissingField("Assignee").into());
        }
        let op = WriteOp::UpdateTask {
            id: id.to_string(),
            patch,
        };
        Ok(self.write(op).await?.map(|_| ()))
    }

    pub async fn delete_task(&self, id: &str) -> ConsoleResult<Outcome<()>> {
        let op = WriteOp::DeleteTask { id: id.to_string() };
        Ok(self.write(op).await?.map(|_| ()))
    }

    // Members

    pub async fn load_members(&self) -> ConsoleResult<Vec<Member>> {
        Ok(self.ctx.primary.get_members().await?)
    }

    pub async fn add_member(&self, name: &str) -> ConsoleResult<Outcome<Member>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuleError::MissingField("Member name").into());
        }
        let op = WriteOp::AddMember {
            member: NewMember {
                name: name.to_string(),
            },
        };
        let describe = op.describe();
        self.write(op)
            .await?
            .try_map(|a| a.into_member().ok_or(ConsoleError::UnexpectedResult(describe)))
    }

    pub async fn rename_member(&self, id: &str, name: &str) -> ConsoleResult<Outcome<()>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuleError::MissingField("Member name").into());
        }
        let op = WriteOp::UpdateMember {
            id: id.to_string(),
            patch: MemberPatch {
                name: Some(name.to_string()),
            },
        };
        Ok(self.write(op).await?.map(|_| ()))
    }

    pub async fn delete_member(&self, id: &str) -> ConsoleResult<Outcome<()>> {
        let op = WriteOp::DeleteMember { id: id.to_string() };
        Ok(self.write(op).await?.map(|_| ()))
    }

    // Inventory

    /// Makes sure the default category exists, then loads products and
    /// categories. A failure to create the default is reported, not fatal.
    pub async fn load_inventory(&self) -> ConsoleResult<Outcome<Inventory>> {
        let mut outcome = Outcome::new(());
        if let Err(e) = self.ctx.primary.initialize_default_category().await {
            log::warn!("Could not create the default category: {}", e);
            outcome = outcome.with_notice(Notice::warning(format!(
                "Could not create the default category: {}",
                e
            )));
        }
        let products = self.read_products().await?;
        let categories = self.read_categories().await?;
        outcome.notices.extend(products.notices);
        outcome.notices.extend(categories.notices);
        Ok(outcome.map(|_| Inventory {
            products: products.value,
            categories: categories.value,
        }))
    }

    async fn find_product(&self, id: &str) -> ConsoleResult<Product> {
        self.read_products()
            .await?
            .value
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found("product", id))
    }

    async fn find_category(&self, id: &str) -> ConsoleResult<Category> {
        self.read_categories()
            .await?
            .value
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("category", id))
    }

    /// Without `category_id` the product lands in the default category.
    pub async fn add_product(
        &self,
        name: &str,
        stock: i64,
        threshold: i64,
        category_id: Option<&str>,
    ) -> ConsoleResult<Outcome<Product>> {
        rules::check_new_product(name, stock, threshold)?;
        let inventory = self.load_inventory().await?;
        let category_id = match category_id {
            Some(id) => match inventory.value.categories.iter().find(|c| c.id == id) {
                Some(category) => category.id.clone(),
                None => return Err(RuleError::UnknownCategory(id.to_string()).into()),
            },
            None => match inventory.value.default_category() {
                Some(category) => category.id.clone(),
                None => return Err(not_found("category", DEFAULT_CATEGORY_NAME)),
            },
        };

        let op = WriteOp::AddProduct {
            product: NewProduct {
                name: name.trim().to_string(),
                stock,
                threshold,
                category_id,
            },
        };
        let describe = op.describe();
        let mut outcome = self
            .write(op)
            .await?
            .try_map(|a| a.into_product().ok_or(ConsoleError::UnexpectedResult(describe)))?;
        outcome.notices.splice(0..0, inventory.notices);
        if rules::is_low_stock(&outcome.value) {
            let notice = Notice::warning(format!(
                "{} starts below its threshold ({} < {})",
                outcome.value.name, outcome.value.stock, outcome.value.threshold
            ));
            outcome = outcome.with_notice(notice);
        }
        Ok(outcome)
    }

    pub async fn edit_product(&self, id: &str, patch: ProductPatch) -> ConsoleResult<Outcome<()>> {
        if patch.is_empty() {
            return Err(ConsoleError::EmptyPatch);
        }
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(RuleError::MissingField("Product name").into());
        }
        if patch.stock.is_some_and(|s| s < 0) {
            return Err(RuleError::Negative("Stock").into());
        }
        if patch.threshold.is_some_and(|t| t < 0) {
            return Err(RuleError::Negative("Threshold").into());
        }
        if let Some(category_id) = &patch.category_id {
            let categories = self.read_categories().await?.value;
            if !categories.iter().any(|c| &c.id == category_id) {
                return Err(RuleError::UnknownCategory(category_id.clone()).into());
            }
        }
        let op = WriteOp::UpdateProduct {
            id: id.to_string(),
            patch,
        };
        Ok(self.write(op).await?.map(|_| ()))
    }

    pub async fn delete_product(&self, id: &str) -> ConsoleResult<Outcome<()>> {
        let op = WriteOp::DeleteProduct { id: id.to_string() };
        Ok(self.write(op).await?.map(|_| ()))
    }

    async fn change_stock(
        &self,
        product: &Product,
        change: StockChange,
    ) -> ConsoleResult<Outcome<StockChange>> {
        let op = WriteOp::UpdateProduct {
            id: product.id.clone(),
            patch: ProductPatch::stock(change.after),
        };
        let mut outcome = self.write(op).await?.map(|_| change);
        if change.low_stock {
            outcome = outcome.with_notice(low_stock_notice(product, &change));
        }
        Ok(outcome)
    }

    /// Removes `quantity` units. Rejected without any write when it would go
    /// below zero.
    pub async fn outbound(&self, id: &str, quantity: i64) -> ConsoleResult<Outcome<StockChange>> {
        let product = self.find_product(id).await?;
        let change = rules::outbound(&product, quantity)?;
        self.change_stock(&product, change).await
    }

    pub async fn inbound(&self, id: &str, quantity: i64) -> ConsoleResult<Outcome<StockChange>> {
        let product = self.find_product(id).await?;
        let change = rules::inbound(&product, quantity)?;
        self.change_stock(&product, change).await
    }

    /// Returns the category the product now belongs to.
    pub async fn move_product(
        &self,
        id: &str,
        category_id: &str,
    ) -> ConsoleResult<Outcome<Category>> {
        let product = self.find_product(id).await?;
        let categories = self.read_categories().await?.value;
        let target = rules::check_move(&product, category_id, &categories)?.clone();
        let op = WriteOp::UpdateProduct {
            id: product.id,
            patch: ProductPatch::category(target.id.clone()),
        };
        Ok(self.write(op).await?.map(|_| target))
    }

    // Categories

    pub async fn add_category(&self, name: &str) -> ConsoleResult<Outcome<Category>> {
        rules::check_category_name(name)?;
        let op = WriteOp::AddCategory {
            category: NewCategory {
                name: name.trim().to_string(),
            },
        };
        let describe = op.describe();
        self.write(op)
            .await?
            .try_map(|a| a.into_category().ok_or(ConsoleError::UnexpectedResult(describe)))
    }

    pub async fn rename_category(&self, id: &str, name: &str) -> ConsoleResult<Outcome<()>> {
        rules::check_category_name(name)?;
        let category = self.find_category(id).await?;
        if category.is_default() {
            return Err(RuleError::DefaultCategoryProtected.into());
        }
        let op = WriteOp::UpdateCategory {
            id: category.id,
            patch: CategoryPatch {
                name: Some(name.trim().to_string()),
            },
        };
        Ok(self.write(op).await?.map(|_| ()))
    }

    /// Moves the category's products to the default category, then deletes it.
    /// The default is recreated first if it has gone missing, so the products
    /// always have a target.
    pub async fn delete_category(&self, id: &str) -> ConsoleResult<Outcome<()>> {
        let category = self.find_category(id).await?;
        rules::check_category_delete(&category)?;
        if let Err(e) = self.ctx.primary.initialize_default_category().await {
            if !self.falls_back() {
                return Err(e.into());
            }
            log::warn!("Could not create the default category: {}", e);
        }
        let op = WriteOp::DeleteCategory { id: category.id };
        Ok(self.write(op).await?.map(|_| ()))
    }

    // Dashboard

    pub async fn dashboard(&self) -> ConsoleResult<Outcome<DashboardSummary>> {
        let mut tasks = self.load_tasks().await?;
        let products = self.read_products().await?;
        tasks.notices.extend(products.notices);
        Ok(tasks.map(|tasks| rules::summarize(&tasks, &products.value, &Local::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{fake, LocalStore, RemoteStore, SelectionReason, Storage};
    use std::sync::Arc;
    use std::time::Duration;

    fn local_console() -> Console {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        Console::new(StorageContext::local_only(local, SelectionReason::ForcedLocal))
    }

    async fn remote_console(policy: WritePolicy) -> (Console, fake::Shared) {
        let (base, db) = fake::start().await;
        let remote = RemoteStore::new(&base, "test-anon-key-0123456789", Duration::from_secs(5))
            .unwrap();
        let ctx = StorageContext {
            primary: Arc::new(remote),
            local: Arc::new(LocalStore::open_in_memory().unwrap()),
            reason: SelectionReason::Remote,
            write_policy: policy,
        };
        (Console::new(ctx), db)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_load_tasks_persists_overdue_status() {
        let console = local_console();
        let late = console
            .create_task("File report", "Ana", date(2020, 1, 1), None)
            .await
            .unwrap()
            .value;
        console
            .create_task("Plan Q3", "Lin", date(2999, 1, 1), Some("  ".to_string()))
            .await
            .unwrap();

        let loaded = console.load_tasks().await.unwrap();
        assert!(loaded.notices.is_empty());
        let status_of = |tasks: &[Task], id: &str| {
            tasks.iter().find(|t| t.id == id).map(|t| t.status)
        };
        assert_eq!(status_of(&loaded.value, &late.id), Some(TaskStatus::Overdue));

        let stored = console.context().primary.get_tasks().await.unwrap();
        assert_eq!(status_of(&stored, &late.id), Some(TaskStatus::Overdue));
        assert!(stored.iter().all(|t| t.description.is_none()));
    }

    #[tokio::test]
    async fn test_only_pending_tasks_complete() {
        let console = local_console();
        let open = console
            .create_task("Count stock", "Ana", date(2999, 1, 1), None)
            .await
            .unwrap()
            .value;
        let late = console
            .create_task("Old job", "Ana", date(2020, 1, 1), None)
            .await
            .unwrap()
            .value;
        console.load_tasks().await.unwrap();

        console.complete_task(&open.id).await.unwrap();
        assert!(matches!(
            console.complete_task(&open.id).await,
            Err(ConsoleError::NotPending(TaskStatus::Completed))
        ));
        assert!(matches!(
            console.complete_task(&late.id).await,
            Err(ConsoleError::NotPending(TaskStatus::Overdue))
        ));
        assert!(matches!(
            console.complete_task("missing").await,
            Err(ConsoleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_task_requires_title_and_assignee() {
        let console = local_console();
        let err = console
            .create_task(" ", "Ana", date(2999, 1, 1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Rule(RuleError::MissingField("Title"))));
        assert!(console.load_tasks().await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn test_outbound_walkthrough_with_low_stock_notice() {
        let console = local_console();
        let widget = console
            .add_product("Widget", 10, 5, None)
            .await
            .unwrap()
            .value;

        let first = console.outbound(&widget.id, 5).await.unwrap();
        assert_eq!(first.value.after, 5);
        assert!(first.notices.is_empty());

        let second = console.outbound(&widget.id, 1).await.unwrap();
        assert_eq!(second.value.after, 4);
        assert!(second.value.low_stock);
        assert_eq!(second.notices.len(), 1);
        assert_eq!(second.notices[0].level, Level::Warning);

        let err = console.outbound(&widget.id, 10).await.unwrap_err();
        assert!(matches!(
            err,
            ConsoleError::Rule(RuleError::InsufficientStock { stock: 4, requested: 10 })
        ));
        let inventory = console.load_inventory().await.unwrap().value;
        assert_eq!(inventory.products[0].stock, 4);

        let restocked = console.inbound(&widget.id, 6).await.unwrap();
        assert_eq!(restocked.value.after, 10);
        assert!(restocked.notices.is_empty());
    }

    #[tokio::test]
    async fn test_products_default_to_the_default_category() {
        let console = local_console();
        let widget = console
            .add_product("Widget", 3, 1, None)
            .await
            .unwrap()
            .value;

        let inventory = console.load_inventory().await.unwrap().value;
        assert_eq!(inventory.categories.len(), 1);
        assert_eq!(
            inventory.category_name(&widget.category_id),
            Some(DEFAULT_CATEGORY_NAME)
        );

        let err = console
            .add_product("Gadget", 1, 1, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Rule(RuleError::UnknownCategory(_))));
    }

    #[tokio::test]
    async fn test_move_and_delete_category() {
        let console = local_console();
        let tools = console.add_category("Tools").await.unwrap().value;
        let hammer = console
            .add_product("Hammer", 4, 2, None)
            .await
            .unwrap()
            .value;

        let moved = console.move_product(&hammer.id, &tools.id).await.unwrap();
        assert_eq!(moved.value.name, "Tools");
        assert!(matches!(
            console.move_product(&hammer.id, &tools.id).await,
            Err(ConsoleError::Rule(RuleError::SameCategory))
        ));

        console.delete_category(&tools.id).await.unwrap();
        let inventory = console.load_inventory().await.unwrap().value;
        let default = inventory.default_category().unwrap().clone();
        assert_eq!(inventory.categories.len(), 1);
        assert_eq!(inventory.products[0].category_id, default.id);

        assert!(matches!(
            console.delete_category(&default.id).await,
            Err(ConsoleError::Rule(RuleError::DefaultCategoryProtected))
        ));
        assert!(matches!(
            console.rename_category(&default.id, "Misc").await,
            Err(ConsoleError::Rule(RuleError::DefaultCategoryProtected))
        ));
    }

    #[tokio::test]
    async fn test_members_add_rename_delete() {
        let console = local_console();
        let ana = console.add_member("  Ana ").await.unwrap().value;
        assert_eq!(ana.name, "Ana");

        console.rename_member(&ana.id, "Ana Lima").await.unwrap();
        assert_eq!(console.load_members().await.unwrap()[0].name, "Ana Lima");

        console.delete_member(&ana.id).await.unwrap();
        assert!(console.load_members().await.unwrap().is_empty());
        assert!(console.add_member("").await.is_err());
    }

    #[tokio::test]
    async fn test_dashboard_summarizes_both_entities() {
        let console = local_console();
        console
            .create_task("Old job", "Ana", date(2020, 1, 1), None)
            .await
            .unwrap();
        console.add_product("Widget", 1, 5, None).await.unwrap();
        console.add_product("Gadget", 9, 5, None).await.unwrap();

        let summary = console.dashboard().await.unwrap().value;
        assert_eq!(summary.total_tasks, 1);
        assert_eq!(summary.overdue_tasks, 1);
        assert_eq!(summary.low_stock.len(), 1);
        assert_eq!(summary.low_stock[0].name, "Widget");
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local_and_outbox() {
        let (console, db) = remote_console(WritePolicy::LocalFallback).await;
        db.lock().unwrap().fail_with = Some("57P01".to_string());

        let outcome = console.add_member("Ana").await.unwrap();
        assert_eq!(outcome.value.name, "Ana");
        assert_eq!(outcome.notices.len(), 1);
        assert_eq!(outcome.notices[0].level, Level::Warning);

        let ctx = console.context();
        assert_eq!(ctx.local.get_members().await.unwrap().len(), 1);
        assert_eq!(outbox::pending(&ctx.local).unwrap().len(), 1);

        db.lock().unwrap().fail_with = None;
        let report = outbox::replay(&ctx.local, ctx.primary.as_ref())
            .await
            .unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(db.lock().unwrap().tables["members"].len(), 1);
    }

    #[tokio::test]
    async fn test_strict_policy_changes_nothing_on_failure() {
        let (console, db) = remote_console(WritePolicy::Strict).await;
        db.lock().unwrap().fail_with = Some("57P01".to_string());

        let err = console.add_member("Ana").await.unwrap_err();
        assert!(matches!(err, ConsoleError::Storage(StorageError::Status { .. })));

        let ctx = console.context();
        assert!(ctx.local.get_members().await.unwrap().is_empty());
        assert!(outbox::pending(&ctx.local).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_product_during_outage_is_queued_locally() {
        let (console, db) = remote_console(WritePolicy::LocalFallback).await;
        db.lock().unwrap().fail_with = Some("57P01".to_string());

        let outcome = console.add_product("Widget", 10, 5, None).await.unwrap();
        assert_eq!(outcome.value.name, "Widget");
        assert!(outcome.notices.iter().all(|n| n.level == Level::Warning));
        assert!(!outcome.notices.is_empty());

        let ctx = console.context();
        let local_products = ctx.local.get_products().await.unwrap();
        assert_eq!(local_products.len(), 1);
        let local_categories = ctx.local.get_categories().await.unwrap();
        assert_eq!(local_categories.len(), 1);
        assert_eq!(local_products[0].category_id, local_categories[0].id);
        assert_eq!(outbox::pending(&ctx.local).unwrap().len(), 1);

        let change = console.outbound(&outcome.value.id, 3).await.unwrap();
        assert_eq!(change.value.after, 7);
        assert_eq!(ctx.local.get_products().await.unwrap()[0].stock, 7);
        assert_eq!(outbox::pending(&ctx.local).unwrap().len(), 2);
        assert!(db.lock().unwrap().tables.get("inventory_items").is_none());
    }

    #[tokio::test]
    async fn test_strict_policy_does_not_read_locally() {
        let (console, db) = remote_console(WritePolicy::Strict).await;
        db.lock().unwrap().fail_with = Some("57P01".to_string());

        let err = console.add_product("Widget", 10, 5, None).await.unwrap_err();
        assert!(matches!(err, ConsoleError::Storage(StorageError::Status { .. })));
        assert!(console.context().local.get_products().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_category_recreates_missing_default() {
        let console = local_console();
        let tools = console.add_category("Tools").await.unwrap().value;
        let hammer = console
            .add_product("Hammer", 4, 2, Some(tools.id.as_str()))
            .await
            .unwrap()
            .value;
        let inventory = console.load_inventory().await.unwrap().value;
        let old_default = inventory.default_category().unwrap().id.clone();
        console
            .context()
            .primary
            .delete_category(&old_default)
            .await
            .unwrap();

        console.delete_category(&tools.id).await.unwrap();
        let inventory = console.load_inventory().await.unwrap().value;
        let default = inventory.default_category().unwrap();
        assert_ne!(default.id, old_default);
        assert_eq!(inventory.categories.len(), 1);
        let moved = inventory.products.iter().find(|p| p.id == hammer.id).unwrap();
        assert_eq!(moved.category_id, default.id);
    }

    #[tokio::test]
    async fn test_edit_task_clears_blank_description() {
        let console = local_console();
        let task = console
            .create_task("Count stock", "Ana", date(2999, 1, 1), Some("Back room".to_string()))
            .await
            .unwrap()
            .value;
        assert_eq!(task.description.as_deref(), Some("Back room"));

        let patch = TaskPatch {
            description: Some("   ".to_string()),
            ..Default::default()
        };
        console.edit_task(&task.id, patch).await.unwrap();
        let stored = console.context().primary.get_tasks().await.unwrap();
        assert_eq!(stored[0].description, None);
    }

    #[tokio::test]
    async fn test_remote_inventory_flow() {
        let (console, db) = remote_console(WritePolicy::LocalFallback).await;
        let widget = console
            .add_product("Widget", 10, 5, None)
            .await
            .unwrap()
            .value;
        let change = console.outbound(&widget.id, 6).await.unwrap();
        assert!(change.value.low_stock);

        let db = db.lock().unwrap();
        assert_eq!(db.tables["categories"].len(), 1);
        assert_eq!(db.tables["inventory_items"][0]["stock"], 4);
    }
}
