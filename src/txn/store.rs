use super::{Participant, Transaction};
use crate::prelude::*;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONTEXT: &str = "spatialsrv.txn.DataStore";
const FILE_VERSION: i32 = 1;

/// Named bindings that survive restarts, read and written inside transactions.
///
/// Every binding carries the version of the commit that last wrote it. A
/// transaction remembers the version of each binding it read, and refuses to
/// commit with [`Error::Conflict`] if any of them moved in the meantime.
#[derive(Clone)]
pub struct DataStore {
    shared: Arc<Shared>,
}

struct Shared {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    version: u64,
    bindings: BTreeMap<String, Binding>,
}

struct Binding {
    version: u64,
    json: String,
}

/// On-disk layout, one NBT compound.
#[derive(Serialize, Deserialize)]
struct LevelFile {
    #[serde(rename = "Version")]
    version: i32,
    #[serde(rename = "Bindings")]
    bindings: BTreeMap<String, String>,
}

impl DataStore {
    pub fn in_memory() -> Self {
        Self::with_bindings(None, BTreeMap::new())
    }

    /// Opens the store kept in `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bindings = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: LevelFile = fastnbt::from_bytes(&bytes)?;
                if file.version != FILE_VERSION {
                    return Err(Error::VersionMismatch {
                        stored: file.version.to_string(),
                        current: FILE_VERSION.to_string(),
                    });
                }
                file.bindings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        log::info!("opened data store {} with {} bindings", path.display(), bindings.len());
        Ok(Self::with_bindings(Some(path), bindings))
    }

    fn with_bindings(path: Option<PathBuf>, bindings: BTreeMap<String, String>) -> Self {
        let inner = Inner {
            version: 1,
            bindings: bindings
                .into_iter()
                .map(|(key, json)| (key, Binding { version: 1, json }))
                .collect(),
        };
        Self {
            shared: Arc::new(Shared { path, inner: Mutex::new(inner) }),
        }
    }

    pub fn get_binding<T: DeserializeOwned>(&self, txn: &mut Transaction, key: &str) -> Result<Option<T>> {
        let ctx = self.context(txn)?;
        let json = match ctx.writes.get(key) {
            Some(pending) => pending.clone(),
            None => {
                let inner = self.shared.inner.lock();
                let binding = inner.bindings.get(key);
                ctx.reads.entry(key.to_string()).or_insert(binding.map(|b| b.version));
                binding.map(|b| b.json.clone())
            }
        };
        json.map(|json| serde_json::from_str(&json)).transpose().map_err(Error::from)
    }

    pub fn set_binding<T: Serialize>(&self, txn: &mut Transaction, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.context(txn)?.writes.insert(key.to_string(), Some(json));
        Ok(())
    }

    /// Returns whether the binding existed.
    pub fn remove_binding(&self, txn: &mut Transaction, key: &str) -> Result<bool> {
        let existed = self.get_binding::<serde_json::Value>(txn, key)?.is_some();
        self.context(txn)?.writes.insert(key.to_string(), None);
        Ok(existed)
    }

    /// Hands out the next number of the counter stored under `key`, starting at 1.
    pub fn next_id(&self, txn: &mut Transaction, key: &str) -> Result<u64> {
        let next = self.get_binding::<u64>(txn, key)?.unwrap_or(0) + 1;
        self.set_binding(txn, key, &next)?;
        Ok(next)
    }

    /// The committed value of a binding, read outside of any transaction.
    pub fn committed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let inner = self.shared.inner.lock();
        inner
            .bindings
            .get(key)
            .map(|b| serde_json::from_str(&b.json))
            .transpose()
            .map_err(Error::from)
    }

    pub fn binding_names(&self, prefix: &str) -> Vec<String> {
        let inner = self.shared.inner.lock();
        inner.bindings.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    fn context<'t>(&self, txn: &'t mut Transaction) -> Result<&'t mut StoreContext> {
        let shared = self.shared.clone();
        txn.join(CONTEXT, move || StoreContext {
            shared,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        })
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore").field("path", &self.shared.path).finish()
    }
}

struct StoreContext {
    shared: Arc<Shared>,
    reads: HashMap<String, Option<u64>>,
    writes: BTreeMap<String, Option<String>>,
}

impl Participant for StoreContext {
    fn prepare(&mut self) -> Result<()> {
        let inner = self.shared.inner.lock();
        for (key, seen) in &self.reads {
            if inner.bindings.get(key).map(|b| b.version) != *seen {
                return Err(Error::Conflict(key.clone()));
            }
        }
        Ok(())
    }

    fn commit(&mut self) {
        if self.writes.is_empty() {
            return;
        }
        let mut inner = self.shared.inner.lock();
        inner.version += 1;
        let version = inner.version;
        for (key, value) in std::mem::take(&mut self.writes) {
            match value {
                Some(json) => {
                    inner.bindings.insert(key, Binding { version, json });
                }
                None => {
                    inner.bindings.remove(&key);
                }
            }
        }
        if let Some(path) = &self.shared.path {
            if let Err(e) = write_level(path, &inner) {
                log::error!("unable to persist data store to {}: {e}", path.display());
            }
        }
    }

    fn abort(&mut self, _retryable: bool) {
        self.reads.clear();
        self.writes.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn write_level(path: &Path, inner: &Inner) -> Result<()> {
    let file = LevelFile {
        version: FILE_VERSION,
        bindings: inner.bindings.iter().map(|(k, b)| (k.clone(), b.json.clone())).collect(),
    };
    let bytes = fastnbt::to_bytes(&file)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
