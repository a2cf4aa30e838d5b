//! # Course Content Resolution
//!
//! Turns a course id into its download tree: course → module → item → file.
//! [`ApiContentResolver`] pulls modules and files through the regular use case
//! machinery, so the fetched lists also land in the Local Store and serve
//! later cached reads.
//!
//! Only module items of type `File` become download items. Files no module
//! references are grouped under a synthetic `files` module.

use async_trait::async_trait;
use core_store::{CacheKey, Entity, Predicate, ReadableExt, Scope, SortDescriptor, Transaction};
use core_sync::{
    FetchCollection, Fetcher, RequestDescriptor, SyncError, TransportResponse, UseCase,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::item::{DownloadItem, ItemKey};
use crate::tree::DownloadTree;

/// Id of the module holding files no module item references.
pub const UNLISTED_FILES_MODULE: &str = "files";

const PAGE_SIZE: u32 = 100;

/// Builds the download tree of a course.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, course_id: &str) -> Result<DownloadTree>;
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Entity for CourseInfo {
    const ENTITY_TYPE: &'static str = "course";

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseModule {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub items: Vec<ModuleItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub content_id: Option<String>,
    #[serde(default)]
    pub position: i64,
}

impl ModuleItem {
    pub fn is_file(&self) -> bool {
        self.item_type == "File"
    }
}

impl Entity for CourseModule {
    const ENTITY_TYPE: &'static str = "course_module";

    fn key(&self) -> String {
        format!("{}/{}", self.course_id, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseFile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub url: String,
}

impl CourseFile {
    pub fn name(&self) -> &str {
        [&self.display_name, &self.filename]
            .into_iter()
            .find(|name| !name.is_empty())
            .map(String::as_str)
            .unwrap_or(self.id.as_str())
    }
}

impl Entity for CourseFile {
    const ENTITY_TYPE: &'static str = "course_file";

    fn key(&self) -> String {
        format!("{}/{}", self.course_id, self.id)
    }
}

/// Canvas sends ids as numbers on some endpoints and strings on others.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number id, got {}",
            other
        ))),
    }
}

// ============================================================================
// Use Cases
// ============================================================================

/// Entity listed per course whose payload does not carry the course id.
pub trait CourseScoped: Entity {
    fn attach(&mut self, course_id: &str);
}

impl CourseScoped for CourseModule {
    fn attach(&mut self, course_id: &str) {
        self.course_id = course_id.to_string();
    }
}

impl CourseScoped for CourseFile {
    fn attach(&mut self, course_id: &str) {
        self.course_id = course_id.to_string();
    }
}

/// Lists one kind of course content and replaces the course's local copy.
pub struct CourseContent<T> {
    course_id: String,
    resource: &'static str,
    query: Vec<(&'static str, String)>,
    _model: PhantomData<fn() -> T>,
}

pub type GetCourseModules = CourseContent<CourseModule>;
pub type GetCourseFiles = CourseContent<CourseFile>;

impl CourseContent<CourseModule> {
    /// `/api/v1/courses/:id/modules?include[]=items&per_page=100`
    pub fn new(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            resource: "modules",
            query: vec![
                ("include[]", "items".to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ],
            _model: PhantomData,
        }
    }
}

impl CourseContent<CourseFile> {
    /// `/api/v1/courses/:id/files?per_page=100`
    pub fn new(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            resource: "files",
            query: vec![("per_page", PAGE_SIZE.to_string())],
            _model: PhantomData,
        }
    }
}

#[async_trait]
impl<T: CourseScoped> UseCase for CourseContent<T> {
    type Model = T;

    fn scope(&self) -> Scope {
        Scope::of::<T>()
            .filter(Predicate::eq("course_id", self.course_id.clone()))
            .order_by(SortDescriptor::asc("position"))
            .order_by(SortDescriptor::asc("id"))
    }

    fn cache_key(&self) -> Option<String> {
        Some(
            CacheKey::new("course_sync")
                .scope(self.resource)
                .param("course_id", &self.course_id)
                .build(),
        )
    }

    fn request(&self) -> Option<RequestDescriptor> {
        let path = format!("/api/v1/courses/{}/{}", self.course_id, self.resource);
        Some(
            self.query
                .iter()
                .fold(RequestDescriptor::get(path), |request, (name, value)| {
                    request.query(*name, value)
                }),
        )
    }

    fn replaces_scope(&self) -> bool {
        true
    }

    async fn write(
        &self,
        response: &TransportResponse,
        tx: &mut Transaction,
    ) -> core_sync::Result<()> {
        let items = response.body.as_array().ok_or_else(|| {
            SyncError::InvalidResponse(format!("expected a {} array", self.resource))
        })?;

        for item in items {
            let mut entity: T = serde_json::from_value(item.clone())?;
            entity.attach(&self.course_id);
            tx.upsert_entity(&entity).await?;
        }
        Ok(())
    }
}

/// `/api/v1/courses/:id`
pub fn get_course(course_id: &str) -> FetchCollection<CourseInfo> {
    FetchCollection::new(RequestDescriptor::get(format!("/api/v1/courses/{}", course_id)))
        .with_cache_key(CacheKey::new("course_sync").scope("course").param("course_id", course_id))
        .with_scope(Scope::of::<CourseInfo>().filter(Predicate::eq("id", course_id)))
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves content through the course, module and file endpoints.
pub struct ApiContentResolver {
    fetcher: Arc<Fetcher>,
}

impl ApiContentResolver {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ContentResolver for ApiContentResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, course_id: &str) -> Result<DownloadTree> {
        let course = get_course(course_id);
        let modules = GetCourseModules::new(course_id);
        let files = GetCourseFiles::new(course_id);

        self.fetcher.fetch(&course).await?;
        self.fetcher.exhaust(&modules).await?;
        self.fetcher.exhaust(&files).await?;

        let store = self.fetcher.store();
        let info = store
            .get_entity::<CourseInfo>(course_id)
            .await?
            .unwrap_or_else(|| CourseInfo {
                id: course_id.to_string(),
                name: String::new(),
            });
        let modules: Vec<CourseModule> = store.fetch_entities(&modules.scope()).await?;
        let files: Vec<CourseFile> = store.fetch_entities(&files.scope()).await?;

        debug!(
            course_id,
            modules = modules.len(),
            files = files.len(),
            "Resolved course content"
        );
        build_tree(&info, &modules, &files)
    }
}

/// Assembles the download tree from fetched content.
///
/// A file referenced by several module items is downloaded once, under the
/// first item that references it. Items pointing at unknown files and
/// modules without downloadable items are left out.
pub fn build_tree(
    course: &CourseInfo,
    modules: &[CourseModule],
    files: &[CourseFile],
) -> Result<DownloadTree> {
    let course_id = course.id.as_str();
    let course_key = ItemKey::course(course_id);
    let name = if course.name.is_empty() {
        format!("Course {}", course_id)
    } else {
        course.name.clone()
    };
    let mut tree = DownloadTree::new(DownloadItem::new(course_key.clone(), name))?;

    let by_id: HashMap<&str, &CourseFile> = files.iter().map(|f| (f.id.as_str(), f)).collect();
    let mut placed: HashSet<&str> = HashSet::new();

    let mut modules: Vec<&CourseModule> = modules.iter().collect();
    modules.sort_by_key(|m| m.position);

    for module in &modules {
        let mut entries = Vec::new();
        let mut items: Vec<&ModuleItem> = module.items.iter().filter(|i| i.is_file()).collect();
        items.sort_by_key(|i| i.position);

        for item in items {
            let Some(file) = item
                .content_id
                .as_deref()
                .and_then(|id| by_id.get(id).copied())
            else {
                continue;
            };
            if placed.insert(file.id.as_str()) {
                entries.push((item, file));
            }
        }
        if entries.is_empty() {
            continue;
        }

        let module_key = ItemKey::module(course_id, &module.id);
        tree.insert(
            DownloadItem::new(module_key.clone(), &module.name)
                .with_parent(course_key.clone())
                .with_position(module.position),
        )?;
        for (item, file) in entries {
            let item_key = ItemKey::item(course_id, &item.id);
            tree.insert(
                DownloadItem::new(item_key.clone(), &item.title)
                    .with_parent(module_key.clone())
                    .with_position(item.position),
            )?;
            tree.insert(file_item(course_id, file).with_parent(item_key))?;
        }
    }

    let unlisted: Vec<&CourseFile> = files
        .iter()
        .filter(|f| !placed.contains(f.id.as_str()))
        .collect();
    if !unlisted.is_empty() {
        let module_key = ItemKey::module(course_id, UNLISTED_FILES_MODULE);
        let after_modules = modules.last().map(|m| m.position + 1).unwrap_or(0);
        tree.insert(
            DownloadItem::new(module_key.clone(), "Files")
                .with_parent(course_key)
                .with_position(after_modules),
        )?;
        for (position, file) in unlisted.into_iter().enumerate() {
            tree.insert(
                file_item(course_id, file)
                    .with_parent(module_key.clone())
                    .with_position(position as i64),
            )?;
        }
    }

    Ok(tree)
}

fn file_item(course_id: &str, file: &CourseFile) -> DownloadItem {
    DownloadItem::file(course_id, &file.id, file.name(), &file.url, file.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DownloadStatus, ItemKind};
    use bridge_traits::ManualClock;
    use core_store::{CachePolicy, LocalStore, MemoryStore};
    use core_sync::Transport;
    use serde_json::json;

    /// Serves the course, its modules and its files, one page each.
    struct CourseTransport;

    #[async_trait]
    impl Transport for CourseTransport {
        async fn send(&self, request: &RequestDescriptor) -> core_sync::Result<TransportResponse> {
            let body = match request.describe().as_str() {
                "GET /api/v1/courses/42" => json!({ "id": 42, "name": "Biology" }),
                "GET /api/v1/courses/42/modules" => modules_json(),
                "GET /api/v1/courses/42/files" => files_json(),
                other => return Err(SyncError::InvalidRequest(other.to_string())),
            };
            Ok(TransportResponse::new(body))
        }
    }

    fn files_json() -> Value {
        json!([
            { "id": 7, "display_name": "Syllabus.pdf", "size": 10, "url": "https://files/7" },
            { "id": "8", "filename": "lab.docx", "size": 20, "url": "https://files/8" },
            { "id": 9, "display_name": "Extra.zip", "size": 30, "url": "https://files/9" }
        ])
    }

    fn modules_json() -> Value {
        json!([
            {
                "id": 2, "name": "Week 2", "position": 2,
                "items": [
                    { "id": 21, "title": "Lab", "type": "File", "content_id": 8, "position": 1 }
                ]
            },
            {
                "id": 1, "name": "Week 1", "position": 1,
                "items": [
                    { "id": 11, "title": "Welcome", "type": "Page", "position": 1 },
                    { "id": 12, "title": "Syllabus", "type": "File", "content_id": "7", "position": 2 },
                    { "id": 13, "title": "Syllabus again", "type": "File", "content_id": 7, "position": 3 }
                ]
            },
            { "id": 3, "name": "Empty", "position": 3, "items": [] }
        ])
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value, course_id: &str) -> Vec<T>
    where
        T: CourseScoped,
    {
        serde_json::from_value::<Vec<T>>(value)
            .unwrap()
            .into_iter()
            .map(|mut entity| {
                entity.attach(course_id);
                entity
            })
            .collect()
    }

    #[test]
    fn test_ids_accept_strings_and_numbers() {
        let item: ModuleItem =
            serde_json::from_value(json!({ "id": 5, "type": "File", "content_id": 7 })).unwrap();
        assert_eq!((item.id.as_str(), item.content_id.as_deref()), ("5", Some("7")));

        let item: ModuleItem = serde_json::from_value(json!({ "id": "5", "type": "Page" })).unwrap();
        assert_eq!(item.content_id, None);
        assert!(serde_json::from_value::<ModuleItem>(json!({ "id": true })).is_err());
    }

    #[test]
    fn test_build_tree_layout() {
        let course = CourseInfo {
            id: "42".to_string(),
            name: "Biology".to_string(),
        };
        let modules: Vec<CourseModule> = decode(modules_json(), "42");
        let files: Vec<CourseFile> = decode(files_json(), "42");

        let tree = build_tree(&course, &modules, &files).unwrap();

        assert_eq!(tree.root().name, "Biology");
        assert_eq!(tree.bytes(), (0, 60));
        assert_eq!(tree.status(), DownloadStatus::NotStarted);

        let layout: Vec<String> = tree.items().iter().map(|i| i.key.to_string()).collect();
        assert_eq!(
            layout,
            vec![
                "42/course/42",
                "42/module/1",
                "42/item/12",
                "42/file/7",
                "42/module/2",
                "42/item/21",
                "42/file/8",
                "42/module/files",
                "42/file/9",
            ]
        );
        let syllabus = tree.get(&ItemKey::file("42", "7")).unwrap();
        assert_eq!(syllabus.name, "Syllabus.pdf");
        assert_eq!(syllabus.url.as_deref(), Some("https://files/7"));
        assert!(tree.get(&ItemKey::module("42", "3")).is_none());
    }

    #[test]
    fn test_course_without_files() {
        let course = CourseInfo {
            id: "1".to_string(),
            name: String::new(),
        };
        let tree = build_tree(&course, &[], &[]).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root().name, "Course 1");
        assert_eq!(tree.root().key.kind, ItemKind::Course);
    }

    #[test]
    fn test_content_requests() {
        let modules = GetCourseModules::new("42");
        assert_eq!(
            modules.request().unwrap().url("https://canvas.test"),
            "https://canvas.test/api/v1/courses/42/modules?include%5B%5D=items&per_page=100"
        );
        assert_eq!(
            modules.cache_key().as_deref(),
            Some("course_sync/modules?course_id=42")
        );
        assert!(modules.replaces_scope());

        let files = GetCourseFiles::new("42");
        assert_eq!(
            files.request().unwrap().url("https://canvas.test"),
            "https://canvas.test/api/v1/courses/42/files?per_page=100"
        );
    }

    #[tokio::test]
    async fn test_api_resolver_fetches_course_content() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(CachePolicy::new(
            store.clone(),
            Arc::new(ManualClock::at_unix(1_700_000_000)),
        ));
        let fetcher = Arc::new(Fetcher::new(cache, Arc::new(CourseTransport)));

        let tree = ApiContentResolver::new(fetcher).resolve("42").await.unwrap();
        assert_eq!(tree.root().name, "Biology");
        assert_eq!(tree.files().len(), 3);
        assert_eq!(
            store.count(&Scope::of::<CourseFile>()).await.unwrap(),
            3
        );
    }
}
