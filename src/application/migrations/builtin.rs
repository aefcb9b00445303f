use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::infra::docstore::{DocStoreError, DocumentStore, IndexDefinition};

use super::Migration;

/// Creates a fixed set of JSON indexes; `down` drops them again.
#[derive(Debug, Clone)]
pub struct IndexMigration {
    version: &'static str,
    description: &'static str,
    indexes: Vec<(&'static str, IndexDefinition)>,
}

impl IndexMigration {
    pub fn new(version: &'static str, description: &'static str) -> Self {
        Self {
            version,
            description,
            indexes: Vec::new(),
        }
    }

    pub fn index(mut self, db: &'static str, name: &str, fields: &[&str]) -> Self {
        self.indexes.push((db, IndexDefinition::new(name, fields)));
        self
    }

    pub fn indexes(&self) -> impl Iterator<Item = (&str, &IndexDefinition)> {
        self.indexes.iter().map(|(db, index)| (*db, index))
    }
}

#[async_trait]
impl Migration for IndexMigration {
    fn version(&self) -> &str {
        self.version
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn up(&self, store: &dyn DocumentStore) -> Result<(), DocStoreError> {
        for (db, index) in &self.indexes {
            if !store.database_exists(db).await? {
                store.create_database(db).await?;
                info!(target = "quire::migrations", db, "created database");
            }
            store.create_index(db, index).await?;
            debug!(
                target = "quire::migrations",
                db,
                index = %index.name,
                "index created"
            );
        }
        Ok(())
    }

    async fn down(&self, store: &dyn DocumentStore) -> Result<(), DocStoreError> {
        for (db, index) in self.indexes.iter().rev() {
            match store.delete_index(db, &index.name).await {
                Ok(()) | Err(DocStoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// The schema history shipped with the service.
pub fn builtin() -> Vec<Arc<dyn Migration>> {
    vec![
        Arc::new(
            IndexMigration::new(
                "001_initial_indexes",
                "Create initial database indexes for performance",
            )
            .index("posts", "status-published-index", &["status", "published_at"])
            .index("posts", "author-created-index", &["author", "created_at"])
            .index("posts", "tags-index", &["tags"])
            .index("posts", "categories-index", &["categories"])
            .index("posts", "featured-status-index", &["is_featured", "status"])
            .index("users", "username-index", &["username"])
            .index("users", "email-index", &["email"])
            .index("users", "role-active-index", &["role", "active"])
            .index("users", "created-at-index", &["created_at"])
            .index("contacts", "status-created-index", &["status", "created_at"])
            .index("contacts", "email-index", &["email"]),
        ),
        Arc::new(
            IndexMigration::new(
                "002_add_view_count_index",
                "Add index for post view count sorting",
            )
            .index("posts", "view-count-status-index", &["view_count", "status"]),
        ),
        Arc::new(
            IndexMigration::new(
                "003_add_reading_time_index",
                "Add index for reading time filtering",
            )
            .index("posts", "reading-time-status-index", &["reading_time", "status"]),
        ),
        Arc::new(
            IndexMigration::new(
                "004_add_contact_indexes",
                "Add compound indexes for contact management",
            )
            .index("contacts", "email-status-index", &["email", "status"])
            .index("contacts", "company-created-index", &["company", "created_at"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::docstore::MemoryDocumentStore;

    #[tokio::test]
    async fn up_creates_missing_databases_and_down_drops_indexes() {
        let store = MemoryDocumentStore::new();
        let migration = IndexMigration::new("900_test", "test")
            .index("contacts", "email-status-index", &["email", "status"]);

        migration.up(&store).await.unwrap();
        let indexes = store.list_indexes("contacts").await.unwrap();
        assert!(indexes.iter().any(|index| index.name == "email-status-index"));

        migration.down(&store).await.unwrap();
        assert!(
            !store
                .list_indexes("contacts")
                .await
                .unwrap()
                .iter()
                .any(|index| index.name == "email-status-index")
        );
        migration.down(&store).await.unwrap();
    }

    #[test]
    fn builtin_versions_are_ordered_and_unique() {
        let versions: Vec<_> = builtin()
            .iter()
            .map(|migration| migration.version().to_string())
            .collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(versions.len(), 4);
    }
}
