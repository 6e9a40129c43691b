//! Filesystem-backed queue store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use box_core::TimestampMs;

use crate::{QueueName, Result, StoreError};

/// A stored object as returned by GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueObject {
    pub content_type: String,
    pub payload: Vec<u8>,
    pub deposited_at: TimestampMs,
    /// Hex SHA-256 of the payload; also the object's filename stem.
    pub digest: String,
}

/// On-disk JSON shape. The payload is hex-encoded to keep object files
/// greppable and newline-free.
#[derive(Serialize, Deserialize)]
struct ObjectFile {
    content_type: String,
    payload: String,
    deposited_at: u64,
    digest: String,
}

/// Counts for the admin channel, computed by lazy scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreMetrics {
    pub queue_count: usize,
    pub object_count: usize,
}

/// Store rooted at `<home>/.box/queues/`.
pub struct QueueStore {
    root: PathBuf,
    permanent: BTreeSet<QueueName>,
    max_object_bytes: usize,
}

impl QueueStore {
    /// Queues that exist on every node.
    pub const BUILTIN_QUEUES: [&'static str; 2] = ["/INBOX", "/whoswho"];

    /// Open (and create) the store. `permanent` entries are normalized here;
    /// an entry that fails normalization is rejected as configuration error.
    pub fn open(
        root: impl AsRef<Path>,
        permanent: impl IntoIterator<Item = String>,
        max_object_bytes: usize,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        restrict_dir(&root)?;

        let mut set = BTreeSet::new();
        for raw in permanent {
            set.insert(QueueName::normalize(&raw)?);
        }

        let store = Self {
            root,
            permanent: set,
            max_object_bytes,
        };
        for builtin in Self::BUILTIN_QUEUES {
            let name = QueueName::normalize(builtin)?;
            store.ensure_queue_dir(&name)?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether GETs on `queue` peek instead of consume.
    pub fn is_permanent(&self, queue: &QueueName) -> bool {
        self.permanent.iter().any(|p| queue.is_under(p))
    }

    /// Store one object. Atomic: temp sibling, fsync, rename. A second PUT
    /// of the same payload lands on the same digest and is a no-op.
    pub fn put(&self, queue: &QueueName, content_type: &str, payload: &[u8]) -> Result<String> {
        if payload.len() > self.max_object_bytes {
            return Err(StoreError::TooLarge {
                size: payload.len(),
                max: self.max_object_bytes,
            });
        }
        let dir = self.ensure_queue_dir(queue)?;
        let digest = hex::encode(Sha256::digest(payload));
        let final_path = dir.join(format!("{digest}.json"));
        if final_path.exists() {
            debug!(%queue, %digest, "duplicate put, keeping existing object");
            return Ok(digest);
        }

        let object = ObjectFile {
            content_type: content_type.to_string(),
            payload: hex::encode(payload),
            deposited_at: TimestampMs::now().into(),
            digest: digest.clone(),
        };
        let json = serde_json::to_vec(&object).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp_path = dir.join(format!(".{digest}.tmp"));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        debug!(%queue, %digest, bytes = payload.len(), "stored object");
        Ok(digest)
    }

    /// Return the lexicographically smallest object. Ephemeral queues consume
    /// it; permanent queues leave it in place (the next GET returns it again).
    pub fn get(&self, queue: &QueueName) -> Result<QueueObject> {
        let dir = self.queue_dir(queue);
        let path = first_object(&dir)?.ok_or(StoreError::NotFound)?;
        let object = read_object(&path)?;
        if !self.is_permanent(queue) {
            fs::remove_file(&path)?;
            debug!(%queue, digest = %object.digest, "consumed object");
        }
        Ok(object)
    }

    /// Drop every object in `queue`, returning how many were removed.
    /// The queue directory itself stays.
    pub fn purge(&self, queue: &QueueName) -> Result<usize> {
        let dir = self.queue_dir(queue);
        if !dir.is_dir() {
            return Err(StoreError::NotFound);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_object_file(&path) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Scan the tree for queue/object counts.
    pub fn metrics(&self) -> Result<StoreMetrics> {
        let mut metrics = StoreMetrics::default();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            metrics.queue_count += 1;
            for object in fs::read_dir(&path)? {
                if is_object_file(&object?.path()) {
                    metrics.object_count += 1;
                }
            }
        }
        Ok(metrics)
    }

    fn queue_dir(&self, queue: &QueueName) -> PathBuf {
        self.root.join(queue.fs_name())
    }

    fn ensure_queue_dir(&self, queue: &QueueName) -> Result<PathBuf> {
        let dir = self.queue_dir(queue);
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
            restrict_dir(&dir)?;
        }
        Ok(dir)
    }
}

fn is_object_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'))
}

fn first_object(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut names: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_object_file(p))
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

fn read_object(path: &Path) -> Result<QueueObject> {
    let data = fs::read_to_string(path)?;
    let file: ObjectFile = serde_json::from_str(&data).map_err(|e| {
        warn!(path = %path.display(), "corrupt object file");
        StoreError::Corrupt(e.to_string())
    })?;
    let payload =
        hex::decode(&file.payload).map_err(|e| StoreError::Corrupt(format!("payload: {e}")))?;
    Ok(QueueObject {
        content_type: file.content_type,
        payload,
        deposited_at: TimestampMs::from(file.deposited_at),
        digest: file.digest,
    })
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
