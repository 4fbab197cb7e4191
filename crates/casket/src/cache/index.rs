//! Bucket-file index: append-only newline-delimited records grouped by
//! hashed user key.

use super::*;

impl Cache {
    /// Stable hash used for bucket path derivation.
    pub(crate) fn hash_key(key: &str) -> String {
        hash_hex(key.as_bytes())
    }

    /// Checksum prefixed to each bucket record to detect torn lines.
    pub(crate) fn hash_entry(payload: &str) -> String {
        hash_hex(payload.as_bytes())
    }

    /// Bucket file holding the records for `key`. Distinct keys may share
    /// a bucket.
    #[must_use]
    pub fn bucket_path(&self, key: &str) -> PathBuf {
        let hashed = Self::hash_key(key);
        self.index_root()
            .join(&hashed[0..2])
            .join(&hashed[2..4])
            .join(&hashed[4..])
    }

    /// Append an index record for `key`, returning the entry as written.
    pub fn insert(
        &self,
        key: &str,
        integrity: Option<&Integrity>,
        size: Option<u64>,
        metadata: Value,
    ) -> Result<Entry> {
        self.ensure_layout()?;
        let entry = Entry {
            key: key.to_string(),
            integrity: integrity.map(|i| i.to_string()),
            time: timestamp_ms(),
            metadata,
            size,
        };
        let bucket = self.bucket_path(key);
        if let Some(parent) = bucket.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create bucket directory {}", parent.display())
            })?;
        }
        let payload = serde_json::to_string(&entry).context("failed to encode index entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&bucket)
            .with_context(|| format!("failed to open bucket {}", bucket.display()))?;
        file.write_all(format_record(&payload).as_bytes())
            .with_context(|| format!("failed to append to bucket {}", bucket.display()))?;
        debug!(key, bucket = %bucket.display(), "index insert");
        Ok(entry)
    }

    /// Latest live entry recorded for `key`, or `None` when the key is
    /// unknown or tombstoned.
    pub fn find(&self, key: &str) -> Result<Option<Entry>> {
        let bucket = self.bucket_path(key);
        let effective = read_bucket(&bucket)?
            .into_iter()
            .filter(|entry| entry.key == key)
            .max_by_key(|entry| entry.time);
        Ok(effective.filter(|entry| entry.integrity.is_some()))
    }

    /// Every effective entry across the index, keyed by user key.
    /// Tombstoned keys are omitted.
    pub fn ls(&self) -> Result<HashMap<String, Entry>> {
        let mut entries: HashMap<String, Entry> = HashMap::new();
        for bucket in self.bucket_files()? {
            for entry in read_bucket(&bucket)? {
                let effective = entries
                    .get(&entry.key)
                    .is_none_or(|existing| entry.time >= existing.time);
                if effective {
                    entries.insert(entry.key.clone(), entry);
                }
            }
        }
        entries.retain(|_, entry| entry.integrity.is_some());
        Ok(entries)
    }

    /// Append a tombstone so `key` no longer resolves. The next
    /// verification drops the key from the rebuilt index.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.insert(key, None, None, Value::Null).map(|_| ())
    }

    /// Every bucket file under the index tree.
    pub(crate) fn bucket_files(&self) -> Result<Vec<PathBuf>> {
        let index_root = self.index_root();
        let mut buckets = Vec::new();
        if !index_root.exists() {
            return Ok(buckets);
        }
        for entry in WalkDir::new(&index_root) {
            let entry = entry
                .with_context(|| format!("failed to walk index tree {}", index_root.display()))?;
            if entry.file_type().is_file() {
                buckets.push(entry.path().to_path_buf());
            }
        }
        Ok(buckets)
    }
}

/// Parse a bucket file, tolerating a missing file and torn lines.
pub(super) fn read_bucket(path: &Path) -> Result<Vec<Entry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read bucket {}", path.display()))
        }
    };
    Ok(parse_bucket_lines(&raw))
}
