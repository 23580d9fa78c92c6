//! Task catalog for one data source.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::DataSource;
use crate::error::{Result, RetrievalError};

/// Suffix of the per-task episode cache file
pub const CACHE_SUFFIX: &str = "_new.pkl";

/// A named manipulation goal such as "pick up apple"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    name: String,
    /// Directory key on disk; kept verbatim so cache paths round-trip
    key: String,
}

impl Task {
    /// Task from a display name; the key is the name with spaces as underscores
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: name.replace(' ', "_"),
        }
    }

    /// Task from an on-disk directory key; the name has underscores as spaces
    pub fn from_key(key: &str) -> Self {
        Self {
            name: key.replace('_', " "),
            key: key.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Object the task acts on: the last word of the name
    pub fn object_name(&self) -> &str {
        self.name.split_whitespace().last().unwrap_or(&self.name)
    }

    /// CLIP prompt used by both ranking stages
    pub fn object_prompt(&self) -> String {
        format!("A photo of {}", self.object_name())
    }
}

/// Underscores as spaces, whitespace runs collapsed
fn normalized(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered set of tasks available in the active data source
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    root: PathBuf,
    source: DataSource,
    tasks: Vec<Task>,
}

impl TaskCatalog {
    /// List task directories under `<subset_dir>/<source>`, sorted by name
    pub fn load(subset_dir: &Path, source: DataSource) -> Result<Self> {
        let source_dir = subset_dir.join(source.dir_name());
        if !source_dir.is_dir() {
            return Err(RetrievalError::CatalogNotFound(source_dir));
        }

        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&source_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                keys.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        keys.sort();

        if keys.is_empty() {
            return Err(RetrievalError::EmptyCatalog(source_dir));
        }

        debug!("Loaded {} task(s) from {}", keys.len(), source_dir.display());
        Ok(Self {
            root: subset_dir.to_path_buf(),
            source,
            tasks: keys.iter().map(|k| Task::from_key(k)).collect(),
        })
    }

    /// Catalog over an explicit task list, rooted at `subset_dir`
    pub fn from_tasks(subset_dir: &Path, source: DataSource, tasks: Vec<Task>) -> Self {
        Self {
            root: subset_dir.to_path_buf(),
            source,
            tasks,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(Task::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    /// Exact match on the normalized name
    pub fn find(&self, name: &str) -> Option<&Task> {
        let wanted = normalized(name);
        self.tasks.iter().find(|t| normalized(t.name()) == wanted)
    }

    /// Like [`TaskCatalog::find`] but ignoring case
    pub fn find_ignore_case(&self, name: &str) -> Option<&Task> {
        let wanted = normalized(name).to_lowercase();
        self.tasks
            .iter()
            .find(|t| normalized(t.name()).to_lowercase() == wanted)
    }

    /// `<root>/<source>`
    pub fn source_dir(&self) -> PathBuf {
        self.root.join(self.source.dir_name())
    }

    /// `<root>/<source>/<key>/<key>_new.pkl`
    pub fn cache_path(&self, task: &Task) -> PathBuf {
        let key = task.key();
        self.source_dir()
            .join(key)
            .join(format!("{key}{CACHE_SUFFIX}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_naming() {
        let task = Task::from_key("pick_up_red_apple");
        assert_eq!(task.name(), "pick up red apple");
        assert_eq!(task.key(), "pick_up_red_apple");
        assert_eq!(task.object_name(), "apple");
        assert_eq!(task.object_prompt(), "A photo of apple");
    }

    #[test]
    fn test_single_word_task_object() {
        assert_eq!(Task::new("drawer").object_name(), "drawer");
    }

    #[test]
    fn test_load_sorts_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let droid = dir.path().join("droid");
        for key in ["pick_up_banana", "open_drawer", "pick_up_apple"] {
            std::fs::create_dir_all(droid.join(key)).unwrap();
        }
        std::fs::write(droid.join("README.txt"), "not a task").unwrap();

        let catalog = TaskCatalog::load(dir.path(), DataSource::Droid).unwrap();
        assert_eq!(
            catalog.names(),
            vec!["open drawer", "pick up apple", "pick up banana"]
        );
        assert_eq!(
            catalog.cache_path(&Task::new("open drawer")),
            droid.join("open_drawer").join("open_drawer_new.pkl")
        );
    }

    #[test]
    fn test_cache_path_keeps_directory_key() {
        let dir = tempfile::tempdir().unwrap();
        let droid = dir.path().join("droid");
        std::fs::create_dir_all(droid.join("pick_up__apple")).unwrap();

        let catalog = TaskCatalog::load(dir.path(), DataSource::Droid).unwrap();
        let task = &catalog.tasks()[0];
        assert_eq!(task.key(), "pick_up__apple");
        assert_eq!(task.object_name(), "apple");
        assert_eq!(
            catalog.cache_path(task),
            droid.join("pick_up__apple").join("pick_up__apple_new.pkl")
        );
        // Lookup by the display name still resolves to the stored key
        assert_eq!(catalog.find("pick up apple").map(Task::key), Some("pick_up__apple"));
        assert_eq!(Task::new(task.name()), *task);
    }

    #[test]
    fn test_load_missing_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("droid").join("x")).unwrap();
        assert!(matches!(
            TaskCatalog::load(dir.path(), DataSource::Hoi4d),
            Err(RetrievalError::CatalogNotFound(_))
        ));
    }

    #[test]
    fn test_load_empty_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("customize")).unwrap();
        assert!(matches!(
            TaskCatalog::load(dir.path(), DataSource::Customize),
            Err(RetrievalError::EmptyCatalog(_))
        ));
    }

    #[test]
    fn test_find_variants() {
        let catalog = TaskCatalog::from_tasks(
            Path::new("/data"),
            DataSource::Droid,
            vec![Task::new("pick up apple")],
        );
        assert!(catalog.find("pick up apple").is_some());
        assert!(catalog.find("pick_up_apple").is_some());
        assert!(catalog.find("Pick Up Apple").is_none());
        assert!(catalog.find_ignore_case("Pick Up Apple").is_some());
    }
}
