use crate::masking;
use crate::record::LogRecord;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u64);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub pattern: String,
    pub example: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

/// Outcome of routing one record through the index.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: TemplateId,
    pub created: bool,
    /// Occurrences before this record; 0 for a new template.
    pub previous_count: u64,
    /// Template pushed out to stay under the capacity ceiling.
    pub evicted: Option<Template>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("template snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("template snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub next_id: u64,
    /// Least recently seen first.
    pub templates: Vec<Template>,
}

/// Signature-keyed template table with least-recently-seen eviction.
///
/// Ids come from a monotonically increasing counter, so an evicted id is
/// never handed out again and keeps resolving to "not found".
pub struct PatternIndex {
    templates: LruCache<TemplateId, Template>,
    by_signature: AHashMap<String, TemplateId>,
    next_id: u64,
    evictions: u64,
}

impl PatternIndex {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            templates: LruCache::new(capacity),
            by_signature: AHashMap::new(),
            next_id: 1,
            evictions: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn assign(&mut self, record: &LogRecord) -> Assignment {
        let sig = masking::signature(&record.message);
        let seen_at = record.timestamp;

        if let Some(&id) = self.by_signature.get(&sig) {
            if let Some(t) = self.templates.get_mut(&id) {
                let previous_count = t.count;
                t.count += 1;
                t.last_seen = t.last_seen.max(seen_at);
                return Assignment { id, created: false, previous_count, evicted: None };
            }
            // signature outlived its template; fall through and mint a fresh id
            self.by_signature.remove(&sig);
        }

        let id = TemplateId(self.next_id);
        self.next_id += 1;
        let template = Template {
            id,
            pattern: sig.clone(),
            example: record.raw.clone(),
            first_seen: seen_at,
            last_seen: seen_at,
            count: 1,
        };
        self.by_signature.insert(sig, id);
        let evicted = match self.templates.push(id, template) {
            Some((old_id, old)) if old_id != id => {
                self.by_signature.remove(&old.pattern);
                self.evictions += 1;
                debug!(evicted = %old_id, count = old.count, "template table full, evicted least recently seen");
                Some(old)
            }
            _ => None,
        };
        Assignment { id, created: true, previous_count: 0, evicted }
    }

    /// Read-only lookup; does not refresh recency.
    pub fn get(&self, id: TemplateId) -> Option<&Template> {
        self.templates.peek(&id)
    }

    pub fn contains(&self, id: TemplateId) -> bool {
        self.templates.contains(&id)
    }

    /// Template id a message would map to, without creating anything.
    pub fn lookup(&self, message: &str) -> Option<TemplateId> {
        self.by_signature.get(&masking::signature(message)).copied()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.templates.cap().get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Live templates, most frequent first.
    pub fn templates(&self) -> Vec<&Template> {
        let mut out: Vec<&Template> = self.templates.iter().map(|(_, t)| t).collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        // LruCache iterates most recent first
        let mut templates: Vec<Template> = self.templates.iter().map(|(_, t)| t.clone()).collect();
        templates.reverse();
        IndexSnapshot { next_id: self.next_id, templates }
    }

    pub fn restore(snapshot: IndexSnapshot, capacity: NonZeroUsize) -> Self {
        let mut index = Self::new(capacity);
        let max_id = snapshot.templates.iter().map(|t| t.id.0).max().unwrap_or(0);
        index.next_id = snapshot.next_id.max(max_id + 1);
        for t in snapshot.templates {
            index.by_signature.insert(t.pattern.clone(), t.id);
            if let Some((_, old)) = index.templates.push(t.id, t) {
                index.by_signature.remove(&old.pattern);
            }
        }
        index
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|source| StorageError::Corrupt { path: path.to_path_buf(), source })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), templates = self.len(), "saved template snapshot");
        Ok(())
    }

    /// Loads a snapshot; a missing file yields an empty index.
    pub fn load(path: &Path, capacity: NonZeroUsize) -> Result<Self, StorageError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new(capacity)),
            Err(source) => return Err(StorageError::Io { path: path.to_path_buf(), source }),
        };
        let snapshot: IndexSnapshot = serde_json::from_slice(&raw)
            .map_err(|source| StorageError::Corrupt { path: path.to_path_buf(), source })?;
        Ok(Self::restore(snapshot, capacity))
    }
}
