//! Storage layer
//!
//! One contract, two backends: the local SQLite key-value store and the
//! hosted PostgREST tables. The backend is picked once at startup by
//! [`select_backend`] and handed around inside a [`StorageContext`].

mod local;
mod remote;
mod selector;

use async_trait::async_trait;
use std::fmt;

use crate::error::StorageResult;
use crate::models::{
    Category, CategoryPatch, Member, MemberPatch, NewCategory, NewMember, NewProduct, NewTask,
    Product, ProductPatch, Task, TaskPatch,
};

pub use local::LocalStore;
pub use remote::{RemoteStore, SCHEMA_SQL, TABLES};
pub use selector::{has_valid_remote_config, select_backend, SelectionReason, StorageContext};

#[cfg(test)]
pub(crate) use remote::fake;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

/// CRUD contract satisfied identically by both backends.
///
/// Updates merge only the fields present in the patch. The local store
/// ignores unknown ids; the remote store sends the request regardless.
#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap round trip proving the backend answers.
    async fn ping(&self) -> StorageResult<()>;

    async fn get_tasks(&self) -> StorageResult<Vec<Task>>;
    async fn add_task(&self, task: NewTask) -> StorageResult<Task>;
    async fn update_task(&self, id: &str, patch: TaskPatch) -> StorageResult<()>;
    async fn delete_task(&self, id: &str) -> StorageResult<()>;

    async fn get_products(&self) -> StorageResult<Vec<Product>>;
    async fn add_product(&self, product: NewProduct) -> StorageResult<Product>;
    async fn update_product(&self, id: &str, patch: ProductPatch) -> StorageResult<()>;
    async fn delete_product(&self, id: &str) -> StorageResult<()>;

    async fn get_categories(&self) -> StorageResult<Vec<Category>>;
    async fn add_category(&self, category: NewCategory) -> StorageResult<Category>;
    async fn update_category(&self, id: &str, patch: CategoryPatch) -> StorageResult<()>;
    /// Moves the category's products to the default category, then removes it.
    async fn delete_category(&self, id: &str) -> StorageResult<()>;

    async fn get_members(&self) -> StorageResult<Vec<Member>>;
    async fn add_member(&self, member: NewMember) -> StorageResult<Member>;
    async fn update_member(&self, id: &str, patch: MemberPatch) -> StorageResult<()>;
    async fn delete_member(&self, id: &str) -> StorageResult<()>;

    /// Creates the default category unless one with that name exists.
    async fn initialize_default_category(&self) -> StorageResult<()>;
}
