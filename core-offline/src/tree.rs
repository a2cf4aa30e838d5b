//! # Download Tree
//!
//! Arena of [`DownloadItem`]s for one course. Parents hold child keys and
//! children hold their parent's key; there are no direct references, so a
//! tree can be persisted record by record and rebuilt from them.
//!
//! Only files change on their own. Every file update walks the ancestor
//! path to the course and recomputes each parent from its children, so the
//! course always reports `sum(file.bytes_downloaded) / sum(file.bytes_total)`
//! without re-deriving the whole tree.

use chrono::Utc;
use std::collections::{HashMap, HashSet};

use crate::error::{OfflineError, Result};
use crate::item::{DownloadItem, DownloadStatus, ItemKey, ItemKind};

#[derive(Debug, Clone)]
pub struct DownloadTree {
    root: ItemKey,
    items: HashMap<ItemKey, DownloadItem>,
}

impl DownloadTree {
    /// Starts a tree from its course item.
    pub fn new(mut course: DownloadItem) -> Result<Self> {
        if course.key.kind != ItemKind::Course {
            return Err(OfflineError::InvalidTree(format!(
                "root {} is not a course",
                course.key
            )));
        }
        course.parent = None;
        course.children.clear();

        let root = course.key.clone();
        let mut tree = Self {
            root: root.clone(),
            items: HashMap::from([(root, course)]),
        };
        tree.recompute_all();
        Ok(tree)
    }

    /// Rebuilds a tree from persisted items, checking every parent link.
    pub fn from_items(items: Vec<DownloadItem>) -> Result<Self> {
        let mut roots = items
            .iter()
            .filter(|item| item.key.kind == ItemKind::Course && item.parent.is_none());
        let root = match (roots.next(), roots.next()) {
            (Some(root), None) => root.key.clone(),
            (None, _) => return Err(OfflineError::InvalidTree("no course item".to_string())),
            (Some(_), Some(_)) => {
                return Err(OfflineError::InvalidTree("several course items".to_string()))
            }
        };

        let items: HashMap<ItemKey, DownloadItem> = items
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect();

        for item in items.values() {
            if item.key.course_id != root.course_id {
                return Err(OfflineError::InvalidTree(format!(
                    "{} belongs to another course",
                    item.key
                )));
            }
            if let Some(parent) = &item.parent {
                let linked = items
                    .get(parent)
                    .is_some_and(|p| p.children.contains(&item.key));
                if !linked {
                    return Err(OfflineError::InvalidTree(format!(
                        "{} is not linked from {}",
                        item.key, parent
                    )));
                }
            } else if item.key != root {
                return Err(OfflineError::InvalidTree(format!(
                    "{} has no parent",
                    item.key
                )));
            }
            if let Some(missing) = item.children.iter().find(|c| !items.contains_key(*c)) {
                return Err(OfflineError::InvalidTree(format!(
                    "{} references missing child {}",
                    item.key, missing
                )));
            }
        }

        let tree = Self { root, items };
        // Every item must be reachable from the course exactly once.
        let reachable = tree.descendants(&tree.root);
        let unique: HashSet<&ItemKey> = reachable.iter().collect();
        if reachable.len() != tree.items.len() || unique.len() != reachable.len() {
            return Err(OfflineError::InvalidTree(format!(
                "course {} has unreachable or shared items",
                tree.root.course_id
            )));
        }
        Ok(tree)
    }

    pub fn course_id(&self) -> &str {
        &self.root.course_id
    }

    pub fn root(&self) -> &DownloadItem {
        &self.items[&self.root]
    }

    pub fn get(&self, key: &ItemKey) -> Option<&DownloadItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Never true: a tree always holds its course item.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in depth-first tree order.
    pub fn items(&self) -> Vec<&DownloadItem> {
        self.descendants(&self.root)
            .iter()
            .filter_map(|key| self.items.get(key))
            .collect()
    }

    /// Files in depth-first tree order.
    pub fn files(&self) -> Vec<&DownloadItem> {
        self.items().into_iter().filter(|item| item.is_file()).collect()
    }

    pub fn files_with_status(&self, status: DownloadStatus) -> Vec<&DownloadItem> {
        self.files()
            .into_iter()
            .filter(|item| item.status == status)
            .collect()
    }

    /// `key` and everything below it, depth first.
    pub fn descendants(&self, key: &ItemKey) -> Vec<ItemKey> {
        let mut out = Vec::new();
        let mut stack = vec![key.clone()];
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(item) = self.items.get(&current) {
                stack.extend(item.children.iter().rev().cloned());
                out.push(current);
            }
        }
        out
    }

    /// File keys at or below `key`.
    pub fn files_under(&self, key: &ItemKey) -> Vec<ItemKey> {
        self.descendants(key)
            .into_iter()
            .filter(|k| k.kind == ItemKind::File)
            .collect()
    }

    /// Adds `item` under its parent, keeping siblings ordered by position.
    pub fn insert(&mut self, mut item: DownloadItem) -> Result<()> {
        let parent_key = item
            .parent
            .clone()
            .ok_or_else(|| OfflineError::InvalidTree(format!("{} has no parent", item.key)))?;
        if item.key.course_id != self.root.course_id {
            return Err(OfflineError::InvalidTree(format!(
                "{} belongs to another course",
                item.key
            )));
        }
        if self.items.contains_key(&item.key) {
            return Err(OfflineError::InvalidTree(format!("duplicate item {}", item.key)));
        }

        let parent = self
            .items
            .get(&parent_key)
            .ok_or_else(|| OfflineError::ItemNotFound(parent_key.to_string()))?;
        if parent.is_file() {
            return Err(OfflineError::InvalidTree(format!(
                "file {} cannot have children",
                parent_key
            )));
        }
        let index = parent
            .children
            .iter()
            .position(|sibling| {
                self.items
                    .get(sibling)
                    .is_some_and(|s| s.position > item.position)
            })
            .unwrap_or(parent.children.len());

        item.children.clear();
        let key = item.key.clone();
        self.items.insert(key.clone(), item);
        if let Some(parent) = self.items.get_mut(&parent_key) {
            parent.children.insert(index, key);
        }
        self.recompute_from(&parent_key);
        Ok(())
    }

    /// Records a progress tick for one file and refreshes its ancestors.
    pub fn update_file_progress(
        &mut self,
        key: &ItemKey,
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    ) -> Result<()> {
        let file = self.file_mut(key)?;
        file.bytes_downloaded = bytes_downloaded;
        if let Some(total) = bytes_total {
            file.bytes_total = total;
        }
        file.updated_at = Utc::now();

        self.recompute_ancestors(key);
        Ok(())
    }

    /// Moves a file to `status`, rejecting transitions the status machine forbids.
    pub fn transition(
        &mut self,
        key: &ItemKey,
        status: DownloadStatus,
        error: Option<String>,
    ) -> Result<()> {
        let file = self.file_mut(key)?;
        if !file.status.can_transition_to(status) {
            return Err(OfflineError::InvalidTransition {
                item: key.to_string(),
                from: file.status.to_string(),
                to: status.to_string(),
            });
        }
        file.status = status;
        file.error = error;
        file.updated_at = Utc::now();

        self.recompute_ancestors(key);
        Ok(())
    }

    /// Cancels every file at or below `key` that is not already terminal.
    /// Returns the files that changed.
    pub fn cancel(&mut self, key: &ItemKey) -> Result<Vec<ItemKey>> {
        if !self.items.contains_key(key) {
            return Err(OfflineError::ItemNotFound(key.to_string()));
        }

        let mut cancelled = Vec::new();
        for file in self.files_under(key) {
            let live = self
                .items
                .get(&file)
                .is_some_and(|f| !f.status.is_terminal());
            if live {
                self.transition(&file, DownloadStatus::Cancelled, None)?;
                cancelled.push(file);
            }
        }
        Ok(cancelled)
    }

    /// `key` and its ancestors up to the course, cloned for persistence.
    pub fn ancestry(&self, key: &ItemKey) -> Vec<DownloadItem> {
        let mut out = Vec::new();
        let mut current = self.items.get(key);
        while let Some(item) = current {
            out.push(item.clone());
            current = item.parent.as_ref().and_then(|parent| self.items.get(parent));
        }
        out
    }

    pub fn set_local_path(&mut self, key: &ItemKey, path: impl Into<String>) -> Result<()> {
        self.file_mut(key)?.local_path = Some(path.into());
        Ok(())
    }

    /// Carries completed files over from an earlier tree of the same course,
    /// so re-selecting a course does not download them again.
    pub fn adopt_completed(&mut self, previous: &DownloadTree) {
        for file in previous.files_with_status(DownloadStatus::Completed) {
            if let Some(current) = self.items.get_mut(&file.key) {
                if current.is_file() {
                    current.status = DownloadStatus::Completed;
                    current.bytes_total = file.bytes_total;
                    current.bytes_downloaded = file.bytes_downloaded;
                    current.local_path = file.local_path.clone();
                    current.error = None;
                }
            }
        }
        self.recompute_all();
    }

    /// Marks files left `inProgress` by a run that never finished as failed
    /// with nothing downloaded, so either a download or a retry resumes them.
    /// Returns the files that changed.
    pub fn fail_interrupted(&mut self) -> Vec<ItemKey> {
        let mut interrupted = Vec::new();
        for item in self.items.values_mut().filter(|item| item.is_file()) {
            if item.status != DownloadStatus::InProgress {
                continue;
            }
            item.status = DownloadStatus::Failed;
            item.bytes_downloaded = 0;
            item.error = Some("download interrupted".to_string());
            item.local_path = None;
            item.updated_at = Utc::now();
            interrupted.push(item.key.clone());
        }
        if !interrupted.is_empty() {
            self.recompute_all();
        }
        interrupted
    }

    /// Returns every file to `notStarted` with nothing downloaded.
    pub fn reset(&mut self) {
        for item in self.items.values_mut().filter(|item| item.is_file()) {
            item.status = DownloadStatus::NotStarted;
            item.bytes_downloaded = 0;
            item.error = None;
            item.local_path = None;
            item.updated_at = Utc::now();
        }
        self.recompute_all();
    }

    pub fn status(&self) -> DownloadStatus {
        self.root().status
    }

    pub fn progress(&self) -> f64 {
        self.root().progress()
    }

    /// `(bytes_downloaded, bytes_total)` of the course.
    pub fn bytes(&self) -> (u64, u64) {
        let root = self.root();
        (root.bytes_downloaded, root.bytes_total)
    }

    /// Bytes held on disk by completed files.
    pub fn completed_bytes(&self) -> u64 {
        self.files_with_status(DownloadStatus::Completed)
            .iter()
            .map(|f| f.bytes_downloaded)
            .sum()
    }

    /// Status of a parent given its children's statuses.
    ///
    /// All completed → completed; all not started → not started; all
    /// cancelled → cancelled; otherwise the first of in progress, failed,
    /// cancelled present wins, and a mix of completed and not started counts
    /// as in progress.
    pub fn aggregate_status(statuses: &[DownloadStatus]) -> DownloadStatus {
        use DownloadStatus::*;

        let all = |s: DownloadStatus| statuses.iter().all(|c| *c == s);
        let any = |s: DownloadStatus| statuses.contains(&s);

        if all(Completed) {
            Completed
        } else if all(NotStarted) {
            NotStarted
        } else if all(Cancelled) {
            Cancelled
        } else if any(InProgress) {
            InProgress
        } else if any(Failed) {
            Failed
        } else if any(Cancelled) {
            Cancelled
        } else {
            InProgress
        }
    }

    fn file_mut(&mut self, key: &ItemKey) -> Result<&mut DownloadItem> {
        match self.items.get_mut(key) {
            Some(item) if item.is_file() => Ok(item),
            Some(_) => Err(OfflineError::InvalidTree(format!("{} is not a file", key))),
            None => Err(OfflineError::ItemNotFound(key.to_string())),
        }
    }

    fn recompute_ancestors(&mut self, key: &ItemKey) {
        if let Some(parent) = self.items.get(key).and_then(|item| item.parent.clone()) {
            self.recompute_from(&parent);
        }
    }

    fn recompute_from(&mut self, key: &ItemKey) {
        let mut current = Some(key.clone());
        while let Some(key) = current {
            self.recompute_node(&key);
            current = self.items.get(&key).and_then(|item| item.parent.clone());
        }
    }

    fn recompute_all(&mut self) {
        // Reverse depth-first order visits children before parents.
        for key in self.descendants(&self.root).iter().rev() {
            self.recompute_node(key);
        }
    }

    fn recompute_node(&mut self, key: &ItemKey) {
        let Some(item) = self.items.get(key) else {
            return;
        };
        if item.is_file() {
            return;
        }

        let mut statuses = Vec::with_capacity(item.children.len());
        let (mut downloaded, mut total) = (0u64, 0u64);
        for child in item.children.iter().filter_map(|c| self.items.get(c)) {
            statuses.push(child.status);
            downloaded += child.bytes_downloaded;
            total += child.bytes_total;
        }
        let status = Self::aggregate_status(&statuses);

        if let Some(item) = self.items.get_mut(key) {
            if item.status != status
                || item.bytes_downloaded != downloaded
                || item.bytes_total != total
            {
                item.status = status;
                item.bytes_downloaded = downloaded;
                item.bytes_total = total;
                item.updated_at = Utc::now();
            }
        }
    }
}
