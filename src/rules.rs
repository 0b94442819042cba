//! Inventory and task state rules.
//!
//! Everything here is pure: callers load records, ask these functions what
//! should change, and write the answer back themselves.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use thiserror::Error;

use crate::models::{
    Category, DashboardSummary, Product, Task, TaskStatus, DEFAULT_CATEGORY_NAME,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Quantity must be greater than zero")]
    NonPositiveQuantity,

    #[error("Not enough stock: {stock} on hand, {requested} requested")]
    InsufficientStock { stock: i64, requested: i64 },

    #[error("Product is already in that category")]
    SameCategory,

    #[error("Category '{0}' does not exist")]
    UnknownCategory(String),

    #[error("The default category cannot be deleted or renamed")]
    DefaultCategoryProtected,

    #[error("'{0}' is reserved for the default category")]
    ReservedName(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0} cannot be negative")]
    Negative(&'static str),
}

pub fn is_low_stock(product: &Product) -> bool {
    product.stock < product.threshold
}

/// Result of a stock movement that passed its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub before: i64,
    pub after: i64,
    /// The new level is under the product's threshold. Display only.
    pub low_stock: bool,
}

pub fn outbound(product: &Product, quantity: i64) -> Result<StockChange, RuleError> {
    if quantity <= 0 {
        return Err(RuleError::NonPositiveQuantity);
    }
    let after = product.stock - quantity;
    if after < 0 {
        return Err(RuleError::InsufficientStock {
            stock: product.stock,
            requested: quantity,
        });
    }
    Ok(StockChange {
        before: product.stock,
        after,
        low_stock: after < product.threshold,
    })
}

pub fn inbound(product: &Product, quantity: i64) -> Result<StockChange, RuleError> {
    if quantity <= 0 {
        return Err(RuleError::NonPositiveQuantity);
    }
    let after = product.stock.saturating_add(quantity);
    Ok(StockChange {
        before: product.stock,
        after,
        low_stock: after < product.threshold,
    })
}

/// Checks that `target_id` names an existing category other than the current one.
pub fn check_move<'a>(
    product: &Product,
    target_id: &str,
    categories: &'a [Category],
) -> Result<&'a Category, RuleError> {
    if product.category_id == target_id {
        return Err(RuleError::SameCategory);
    }
    categories
        .iter()
        .find(|c| c.id == target_id)
        .ok_or_else(|| RuleError::UnknownCategory(target_id.to_string()))
}

pub fn check_category_delete(category: &Category) -> Result<(), RuleError> {
    if category.is_default() {
        return Err(RuleError::DefaultCategoryProtected);
    }
    Ok(())
}

/// Names given to user-created categories: non-blank and not the default's.
pub fn check_category_name(name: &str) -> Result<(), RuleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RuleError::MissingField("Category name"));
    }
    if name == DEFAULT_CATEGORY_NAME {
        return Err(RuleError::ReservedName(name.to_string()));
    }
    Ok(())
}

pub fn check_new_product(name: &str, stock: i64, threshold: i64) -> Result<(), RuleError> {
    if name.trim().is_empty() {
        return Err(RuleError::MissingField("Product name"));
    }
    if stock < 0 {
        return Err(RuleError::Negative("Stock"));
    }
    if threshold < 0 {
        return Err(RuleError::Negative("Threshold"));
    }
    Ok(())
}

pub fn check_new_task(title: &str, assignee: &str) -> Result<(), RuleError> {
    if title.trim().is_empty() {
        return Err(RuleError::MissingField("Title"));
    }
    if assignee.trim().is_empty() {
        return Err(RuleError::MissingField("Assignee"));
    }
    Ok(())
}

/// Status a task should have at `now`: a pending task turns overdue once
/// the start (00:00) of its due date has passed in `now`'s timezone.
/// Nothing else changes.
pub fn derive_status<Tz: TimeZone>(task: &Task, now: &DateTime<Tz>) -> TaskStatus {
    let due = task.due_date.and_time(NaiveTime::MIN);
    match task.status {
        TaskStatus::Pending if due < now.naive_local() => TaskStatus::Overdue,
        status => status,
    }
}

/// Ids of the tasks whose stored status differs from the derived one.
pub fn overdue_transitions<Tz: TimeZone>(tasks: &[Task], now: &DateTime<Tz>) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| derive_status(task, now) != task.status)
        .map(|task| task.id.clone())
        .collect()
}

/// Start of the current week (Sunday 00:00) in `now`'s timezone.
pub fn week_start<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let days_back = i64::from(now.weekday().num_days_from_sunday());
    let midnight = (now.date_naive() - Duration::days(days_back)).and_time(NaiveTime::MIN);
    match now.timezone().from_local_datetime(&midnight).earliest() {
        Some(start) => start.with_timezone(&Utc),
        // Midnight skipped by a DST jump; fall back to reading it as UTC.
        None => midnight.and_utc(),
    }
}

/// Rounded percentage of this week's tasks that are completed; 0 when none.
pub fn weekly_completion_rate<Tz: TimeZone>(tasks: &[Task], now: &DateTime<Tz>) -> u32 {
    let start = week_start(now);
    let weekly: Vec<&Task> = tasks.iter().filter(|t| t.created_at >= start).collect();
    if weekly.is_empty() {
        return 0;
    }
    let completed = weekly
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    (completed as f64 / weekly.len() as f64 * 100.0).round() as u32
}

pub fn summarize<Tz: TimeZone>(
    tasks: &[Task],
    products: &[Product],
    now: &DateTime<Tz>,
) -> DashboardSummary {
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    DashboardSummary {
        total_tasks: tasks.len(),
        completed_tasks: count(TaskStatus::Completed),
        pending_tasks: count(TaskStatus::Pending),
        overdue_tasks: count(TaskStatus::Overdue),
        weekly_completion_rate: weekly_completion_rate(tasks, now),
        low_stock: products.iter().filter(|p| is_low_stock(p)).cloned().collect(),
    }
}
