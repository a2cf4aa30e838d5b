//! Persistence of download trees as `download_item` records.

use core_store::{LocalStore, Predicate, ReadableExt, Scope, SortDescriptor};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::item::{DownloadItem, ItemKind};
use crate::tree::DownloadTree;

#[derive(Clone)]
pub struct DownloadRepository {
    store: Arc<dyn LocalStore>,
}

impl DownloadRepository {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Every item of one course.
    pub fn course_scope(course_id: &str) -> Scope {
        Scope::of::<DownloadItem>().filter(Predicate::eq("key.course_id", course_id))
    }

    /// Course items only, one per selected course.
    pub fn courses_scope() -> Scope {
        Scope::of::<DownloadItem>()
            .filter(Predicate::eq("key.kind", ItemKind::Course.as_str()))
            .order_by(SortDescriptor::asc("name"))
    }

    /// Replaces everything stored for the tree's course in one transaction.
    pub async fn save_tree(&self, tree: &DownloadTree) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.delete_matching(&Self::course_scope(tree.course_id())).await?;
        for item in tree.items() {
            tx.upsert_entity(item).await?;
        }
        let changes = tx.save().await?;
        debug!(
            course_id = tree.course_id(),
            changes = changes.len(),
            "Saved download tree"
        );
        Ok(())
    }

    /// Upserts the given items together.
    pub async fn save_items<'a>(
        &self,
        items: impl IntoIterator<Item = &'a DownloadItem>,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        for item in items {
            tx.upsert_entity(item).await?;
        }
        tx.save().await?;
        Ok(())
    }

    pub async fn load_tree(&self, course_id: &str) -> Result<Option<DownloadTree>> {
        let items: Vec<DownloadItem> = self
            .store
            .fetch_entities(&Self::course_scope(course_id))
            .await?;
        if items.is_empty() {
            return Ok(None);
        }
        DownloadTree::from_items(items).map(Some)
    }

    /// Removes a course's items, returning how many were deleted.
    pub async fn delete_course(&self, course_id: &str) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let removed = tx.delete_matching(&Self::course_scope(course_id)).await?;
        tx.save().await?;
        Ok(removed)
    }

    /// Root items of every selected course.
    pub async fn courses(&self) -> Result<Vec<DownloadItem>> {
        Ok(self.store.fetch_entities(&Self::courses_scope()).await?)
    }

    /// Bytes of completed files across all courses.
    pub async fn completed_bytes(&self) -> Result<u64> {
        let files: Vec<DownloadItem> = self
            .store
            .fetch_entities(
                &Scope::of::<DownloadItem>()
                    .filter(Predicate::eq("key.kind", ItemKind::File.as_str()))
                    .filter(Predicate::eq("status", "completed")),
            )
            .await?;
        Ok(files.iter().map(|f| f.bytes_downloaded).sum())
    }
}
