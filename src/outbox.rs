//! Writes as data.
//!
//! Every mutation the console performs is a [`WriteOp`]. When the remote
//! backend rejects one and the policy allows it, the op is applied to the
//! local store and journaled here so the divergence stays visible and can be
//! replayed once the remote backend answers again.

use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::models::{
    Category, CategoryPatch, Member, MemberPatch, NewCategory, NewMember, NewProduct, NewTask,
    Product, ProductPatch, Task, TaskPatch,
};
use crate::storage::{LocalStore, Storage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    AddTask { task: NewTask },
    UpdateTask { id: String, patch: TaskPatch },
    DeleteTask { id: String },
    AddProduct { product: NewProduct },
    UpdateProduct { id: String, patch: ProductPatch },
    DeleteProduct { id: String },
    AddCategory { category: NewCategory },
    UpdateCategory { id: String, patch: CategoryPatch },
    DeleteCategory { id: String },
    AddMember { member: NewMember },
    UpdateMember { id: String, patch: MemberPatch },
    DeleteMember { id: String },
}

/// What a successfully applied op produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Task(Task),
    Product(Product),
    Category(Category),
    Member(Member),
    Done,
}

impl Applied {
    pub fn into_task(self) -> Option<Task> {
        match self {
            Applied::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn into_product(self) -> Option<Product> {
        match self {
            Applied::Product(product) => Some(product),
            _ => None,
        }
    }

    pub fn into_category(self) -> Option<Category> {
        match self {
            Applied::Category(category) => Some(category),
            _ => None,
        }
    }

    pub fn into_member(self) -> Option<Member> {
        match self {
            Applied::Member(member) => Some(member),
            _ => None,
        }
    }
}

impl WriteOp {
    pub async fn apply(&self, storage: &dyn Storage) -> StorageResult<Applied> {
        let applied = match self {
            WriteOp::AddTask { task } => Applied::Task(storage.add_task(task.clone()).await?),
            WriteOp::UpdateTask { id, patch } => {
                storage.update_task(id, patch.clone()).await?;
                Applied::Done
            }
            WriteOp::DeleteTask { id } => {
                storage.delete_task(id).await?;
                Applied::Done
            }
            WriteOp::AddProduct { product } => {
                Applied::Product(storage.add_product(product.clone()).await?)
            }
            WriteOp::UpdateProduct { id, patch } => {
                storage.update_product(id, patch.clone()).await?;
                Applied::Done
            }
            WriteOp::DeleteProduct { id } => {
                storage.delete_product(id).await?;
                Applied::Done
            }
            WriteOp::AddCategory { category } => {
                Applied::Category(storage.add_category(category.clone()).await?)
            }
            WriteOp::UpdateCategory { id, patch } => {
                storage.update_category(id, patch.clone()).await?;
                Applied::Done
            }
            WriteOp::DeleteCategory { id } => {
                storage.delete_category(id).await?;
                Applied::Done
            }
            WriteOp::AddMember { member } => {
                Applied::Member(storage.add_member(member.clone()).await?)
            }
            WriteOp::UpdateMember { id, patch } => {
                storage.update_member(id, patch.clone()).await?;
                Applied::Done
            }
            WriteOp::DeleteMember { id } => {
                storage.delete_member(id).await?;
                Applied::Done
            }
        };
        Ok(applied)
    }

    pub fn describe(&self) -> String {
        match self {
            WriteOp::AddTask { task } => format!("add task '{}'", task.title),
            WriteOp::UpdateTask { id, .. } => format!("update task {}", id),
            WriteOp::DeleteTask { id } => format!("delete task {}", id),
            WriteOp::AddProduct { product } => format!("add product '{}'", product.name),
            WriteOp::UpdateProduct { id, .. } => format!("update product {}", id),
            WriteOp::DeleteProduct { id } => format!("delete product {}", id),
            WriteOp::AddCategory { category } => format!("add category '{}'", category.name),
            WriteOp::UpdateCategory { id, .. } => format!("update category {}", id),
            WriteOp::DeleteCategory { id } => format!("delete category {}", id),
            WriteOp::AddMember { member } => format!("add member '{}'", member.name),
            WriteOp::UpdateMember { id, .. } => format!("update member {}", id),
            WriteOp::DeleteMember { id } => format!("delete member {}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    /// `None` when the stored JSON no longer parses.
    pub op: Option<WriteOp>,
    pub raw: String,
    pub created_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn describe(&self) -> String {
        match &self.op {
            Some(op) => op.describe(),
            None => format!("unreadable entry: {}", self.raw),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
    pub error: Option<String>,
}

pub fn record(store: &LocalStore, op: &WriteOp) -> StorageResult<i64> {
    let json = serde_json::to_string(op)?;
    let id = store.push_outbox(&json)?;
    log::info!("Queued outbox entry {}: {}", id, op.describe());
    Ok(id)
}

pub fn pending(store: &LocalStore) -> StorageResult<Vec<OutboxEntry>> {
    let rows = store.list_outbox()?;
    Ok(rows
        .into_iter()
        .map(|row| OutboxEntry {
            id: row.id,
            op: serde_json::from_str(&row.op).ok(),
            raw: row.op,
            created_at: row.created_at,
            attempts: row.attempts,
            last_error: row.last_error,
        })
        .collect())
}

/// Re-applies queued writes to `target` in order, stopping at the first
/// failure. Unreadable entries are skipped and left in place.
pub async fn replay(store: &LocalStore, target: &dyn Storage) -> StorageResult<ReplayReport> {
    let entries = pending(store)?;
    let mut report = ReplayReport::default();

    for (index, entry) in entries.iter().enumerate() {
        let Some(op) = &entry.op else {
            log::warn!("Skipping unreadable outbox entry {}", entry.id);
            report.remaining += 1;
            continue;
        };

        match op.apply(target).await {
            Ok(_) => {
                store.remove_outbox(entry.id)?;
                report.replayed += 1;
            }
            Err(e) => {
                let message = e.to_string();
                store.mark_outbox_failed(entry.id, &message)?;
                log::warn!("Replay of outbox entry {} failed: {}", entry.id, message);
                report.remaining += entries.len() - index;
                report.error = Some(message);
                break;
            }
        }
    }

    Ok(report)
}

pub fn clear(store: &LocalStore) -> StorageResult<usize> {
    store.clear_outbox()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use chrono::NaiveDate;

    fn add_member(name: &str) -> WriteOp {
        WriteOp::AddMember {
            member: NewMember {
                name: name.to_string(),
            },
        }
    }

    #[test]
    fn ops_serialize_with_a_tag() {
        let op = WriteOp::UpdateTask {
            id: "7".to_string(),
            patch: TaskPatch::status(TaskStatus::Completed),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "updateTask");
        assert_eq!(json["patch"]["status"], "completed");

        let back: WriteOp = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[tokio::test]
    async fn apply_returns_the_created_record() {
        let store = LocalStore::open_in_memory().unwrap();
        let op = WriteOp::AddTask {
            task: NewTask {
                title: "Inventory check".to_string(),
                description: Some("Aisle 3".to_string()),
                assignee: "Ana".to_string(),
                due_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
                status: TaskStatus::Pending,
            },
        };

        match op.apply(&store).await.unwrap() {
            Applied::Task(task) => assert_eq!(task.title, "Inventory check"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn replay_drains_queue_in_order() {
        let journal = LocalStore::open_in_memory().unwrap();
        let target = LocalStore::open_in_memory().unwrap();
        record(&journal, &add_member("First")).unwrap();
        record(&journal, &add_member("Second")).unwrap();

        let report = replay(&journal, &target).await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        assert!(pending(&journal).unwrap().is_empty());

        let names: Vec<String> = target
            .get_members()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn unreadable_entries_stay_queued() {
        let journal = LocalStore::open_in_memory().unwrap();
        let target = LocalStore::open_in_memory().unwrap();
        journal.push_outbox("{\"op\":\"launchRocket\"}").unwrap();
        record(&journal, &add_member("Ana")).unwrap();

        let report = replay(&journal, &target).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 1);

        let left = pending(&journal).unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].op.is_none());
        assert_eq!(clear(&journal).unwrap(), 1);
    }
}
