//! Bounded set of per-request output folders under one root.
//!
//! Every request gets a fresh `<root>/<uuid>` directory. Allocation runs in
//! a single critical section: while the root already holds `max_size` or
//! more folders, the oldest (by creation time) is deleted first.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use meshgen_types::CacheError;
use uuid::Uuid;

pub use meshgen_config::DEFAULT_CACHE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFolder {
    id: String,
    path: PathBuf,
}

impl OutputFolder {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }

    /// URL path under `/static/` for a file in this folder.
    pub fn static_url(&self, file: &str) -> String {
        format!("/static/{}/{}", self.id, file)
    }
}

#[derive(Default)]
struct CacheIndex {
    // Creation order of folders made by this process; breaks ties between
    // equal filesystem timestamps.
    sequence: HashMap<String, u64>,
    next: u64,
}

pub struct OutputCache {
    root: PathBuf,
    max_size: usize,
    index: Mutex<CacheIndex>,
}

struct Candidate {
    name: String,
    path: PathBuf,
    created: SystemTime,
    sequence: u64,
}

impl OutputCache {
    pub fn new(root: impl Into<PathBuf>, max_size: usize) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::info!(target: "cache", "Output cache at {} (capacity {max_size})", root.display());
        Ok(Self {
            root,
            max_size: max_size.max(1),
            index: Mutex::new(CacheIndex::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evict down to `max_size - 1`, then create a fresh folder.
    pub fn allocate(&self) -> Result<OutputFolder, CacheError> {
        let mut index = self.lock();

        let mut candidates = self.list_folders(&index).map_err(|e| CacheError::Create {
            path: self.root.display().to_string(),
            message: e.to_string(),
        })?;
        candidates.sort_by(|a, b| a.created.cmp(&b.created).then(a.sequence.cmp(&b.sequence)));

        let mut remaining = candidates.len();
        for candidate in &candidates {
            if remaining < self.max_size {
                break;
            }
            match fs::remove_dir_all(&candidate.path) {
                Ok(()) => {
                    log::info!(target: "cache", "Evicted output folder {}", candidate.name);
                    index.sequence.remove(&candidate.name);
                    remaining -= 1;
                }
                Err(e) => {
                    let err = CacheError::EvictionIo {
                        path: candidate.path.display().to_string(),
                        message: e.to_string(),
                    };
                    log::warn!(target: "cache", "{err}; trying the next oldest folder");
                }
            }
        }
        if remaining >= self.max_size {
            log::warn!(
                target: "cache",
                "Could not evict enough folders, cache holds {remaining} of {}",
                self.max_size
            );
        }

        let id = Uuid::new_v4().to_string();
        let path = self.root.join(&id);
        fs::create_dir(&path).map_err(|e| CacheError::Create {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let sequence = index.next;
        index.next += 1;
        index.sequence.insert(id.clone(), sequence);
        log::debug!(target: "cache", "Allocated output folder {id}");
        Ok(OutputFolder { id, path })
    }

    fn list_folders(&self, index: &CacheIndex) -> io::Result<Vec<Candidate>> {
        let mut folders = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(m) if m.is_dir() => m,
                _ => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let sequence = index.sequence.get(&name).copied().unwrap_or(0);
            folders.push(Candidate {
                name,
                path: entry.path(),
                created,
                sequence,
            });
        }
        Ok(folders)
    }

    /// Delete a folder whose run failed. Missing folders are fine.
    pub fn discard(&self, folder: &OutputFolder) {
        let mut index = self.lock();
        match fs::remove_dir_all(folder.path()) {
            Ok(()) => log::info!(target: "cache", "Discarded output folder {}", folder.id()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(target: "cache", "Could not discard output folder {}: {e}", folder.id()),
        }
        index.sequence.remove(folder.id());
    }

    pub fn folder_count(&self) -> usize {
        let index = self.lock();
        self.list_folders(&index).map(|f| f.len()).unwrap_or(0)
    }

    /// An existing folder by id. Ids are UUIDs; anything else is refused.
    pub fn folder(&self, id: &str) -> Option<OutputFolder> {
        let parsed = Uuid::parse_str(id).ok()?;
        let id = parsed.to_string();
        let path = self.root.join(&id);
        path.is_dir().then_some(OutputFolder { id, path })
    }

    /// Map a path relative to the root onto the filesystem, refusing
    /// anything that could leave the root.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let trimmed = relative.trim_start_matches('/');
        if trimmed.contains('\\') || trimmed.contains('\0') {
            return None;
        }
        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        resolved.starts_with(&self.root).then_some(resolved)
    }
}
