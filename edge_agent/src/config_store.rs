//! Mutable, file-backed configuration tree.
//!
//! `Settings` is read once at startup; this store holds the parts the agent
//! rewrites at runtime (the `plugins` section). Scoped views created by
//! [`ConfigStore::sub_config`] are detached copies; writing one merges it
//! back into its parent and writes the parent's file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use toml::{Table, Value};
use tracing::{debug, info};

use crate::error::{AgentError, Result};

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    tree: Mutex<Table>,
    write_lock: Mutex<()>,
    parent: Option<(ConfigStore, String)>,
}

impl ConfigStore {
    /// Open the store at `path`. A missing file yields an empty tree.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tree = match fs::read_to_string(&path) {
            Ok(contents) => contents.parse::<Table>().map_err(|e| {
                AgentError::InvalidArgument(format!(
                    "failed reading configuration file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(e.into()),
        };
        info!(file = %path.display(), "opened configuration file");
        Ok(Self::from_table(path, tree))
    }

    /// In-memory store that writes to `path` when asked.
    pub fn from_table(path: impl Into<PathBuf>, tree: Table) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                tree: Mutex::new(tree),
                write_lock: Mutex::new(()),
                parent: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let tree = self.inner.tree.lock();
        lookup(&tree, key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Set `key`, creating intermediate tables as needed.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let mut tree = self.inner.tree.lock();
        insert(&mut tree, key, value.into());
    }

    /// Remove `key` and everything below it.
    pub fn unset(&self, key: &str) {
        let mut tree = self.inner.tree.lock();
        remove(&mut tree, key);
    }

    pub fn replace_subtree(&self, prefix: &str, subtree: Table) {
        let mut tree = self.inner.tree.lock();
        remove(&mut tree, prefix);
        insert(&mut tree, prefix, Value::Table(subtree));
    }

    /// Detached copy of the subtree at `prefix`, empty if absent.
    pub fn sub_config(&self, prefix: &str) -> ConfigStore {
        let subtree = match self.get(prefix) {
            Some(Value::Table(table)) => table,
            _ => Table::new(),
        };
        Self {
            inner: Arc::new(Inner {
                path: self.inner.path.clone(),
                tree: Mutex::new(subtree),
                write_lock: Mutex::new(()),
                parent: Some((self.clone(), prefix.to_string())),
            }),
        }
    }

    pub fn table(&self) -> Table {
        self.inner.tree.lock().clone()
    }

    pub fn merge_to_parent(&self) {
        if let Some((parent, key)) = &self.inner.parent {
            let _guard = parent.inner.write_lock.lock();
            parent.replace_subtree(key, self.table());
        }
    }

    /// Persist the whole tree. On a scoped view, merge into the parent and
    /// write the parent instead.
    pub fn write(&self) -> Result<()> {
        if let Some((parent, _)) = &self.inner.parent {
            self.merge_to_parent();
            return parent.write();
        }

        let _guard = self.inner.write_lock.lock();
        let path = &self.inner.path;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                AgentError::Internal(format!("failed creating config dir {}: {}", dir.display(), e))
            })?;
        }

        let contents = toml::to_string(&*self.inner.tree.lock())
            .map_err(|e| AgentError::Internal(format!("failed serializing configuration: {}", e)))?;
        write_private(path, contents.as_bytes()).map_err(|e| {
            AgentError::Internal(format!("failed writing config file {}: {}", path.display(), e))
        })?;

        debug!(file = %path.display(), "wrote configuration file");
        Ok(())
    }

    pub fn delete_file(&self) -> Result<()> {
        match fs::remove_file(&self.inner.path) {
            Ok(()) => {
                info!(file = %self.inner.path.display(), "deleted configuration file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.inner.path)
            .field("scope", &self.inner.parent.as_ref().map(|(_, key)| key))
            .finish()
    }
}

/// Write `contents` to a file only the owner can read, also when the file
/// already existed with wider permissions.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

fn lookup<'a>(tree: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = tree.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn insert(tree: &mut Table, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            tree.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = tree
                .entry(head.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            if let Value::Table(child) = entry {
                insert(child, rest, value);
            }
        }
    }
}

fn remove(tree: &mut Table, key: &str) {
    match key.split_once('.') {
        None => {
            tree.remove(key);
        }
        Some((head, rest)) => {
            if let Some(Value::Table(child)) = tree.get_mut(head) {
                remove(child, rest);
            }
        }
    }
}
