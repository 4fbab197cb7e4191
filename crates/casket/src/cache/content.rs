//! Content store: immutable blobs at digest-derived paths.

use super::*;

impl Cache {
    /// Deterministic path for the blob described by `integrity`.
    pub(crate) fn content_path(&self, integrity: &Integrity) -> Result<PathBuf> {
        let (algorithm, hex_digest) = integrity.hex()?;
        if hex_digest.len() <= 4 {
            return Err(CacheError::InvalidIntegrity(integrity.to_string()).into());
        }
        Ok(self
            .content_root()
            .join(algorithm.as_str())
            .join(&hex_digest[0..2])
            .join(&hex_digest[2..4])
            .join(&hex_digest[4..]))
    }

    /// Inverse of [`Cache::content_path`]: recover the digest identity
    /// encoded in a content-store file path. `None` means the path does
    /// not belong to any blob.
    pub(crate) fn digest_from_content_path(&self, path: &Path) -> Option<Integrity> {
        let rel = path.strip_prefix(self.content_root()).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|part| part.to_str()).collect();
        let [algo, first, second, tail] = parts.as_slice() else {
            return None;
        };
        let algorithm = algo.parse::<Algorithm>().ok()?;
        Integrity::from_hex(algorithm, &format!("{first}{second}{tail}")).ok()
    }

    /// Write `data` into the content store, returning its integrity.
    /// Blobs already present are left untouched.
    pub fn write_content(&self, algorithm: Algorithm, data: &[u8]) -> Result<Integrity> {
        self.ensure_layout()?;
        let integrity = Integrity::from_data(algorithm, data);
        let dest = self.content_path(&integrity)?;
        if dest.exists() {
            return Ok(integrity);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create content directory {}", parent.display())
            })?;
        }
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())
            .context("failed to create temp file for content write")?;
        tmp.write_all(data)
            .with_context(|| format!("failed to write content for {}", dest.display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("failed to flush content for {}", dest.display()))?;
        tmp.persist(&dest)
            .map_err(|err| anyhow!("failed to persist content {}: {err}", dest.display()))?;
        debug!(path = %dest.display(), size = data.len(), "content write");
        Ok(integrity)
    }

    /// Read a blob, re-checking it against `integrity` before returning.
    pub fn read_content(&self, integrity: &Integrity) -> Result<Vec<u8>> {
        let path = self.content_path(integrity)?;
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read content at {}", path.display()))?;
        if !integrity.check_reader(bytes.as_slice())? {
            return Err(CacheError::IntegrityMismatch { path }.into());
        }
        Ok(bytes)
    }

    /// Whether a blob exists for `integrity`.
    pub fn has_content(&self, integrity: &Integrity) -> Result<bool> {
        Ok(self.content_path(integrity)?.exists())
    }

    /// Store `data` under `key`: content first, then the index record.
    pub fn put(&self, key: &str, data: &[u8], options: PutOptions) -> Result<Entry> {
        let integrity = self.write_content(options.algorithm, data)?;
        self.insert(
            key,
            Some(&integrity),
            Some(data.len() as u64),
            options.metadata,
        )
    }

    /// Fetch the blob recorded for `key`, verifying its integrity.
    pub fn get(&self, key: &str) -> Result<Option<(Entry, Vec<u8>)>> {
        let Some(entry) = self.find(key)? else {
            return Ok(None);
        };
        let Some(raw) = entry.integrity.as_deref() else {
            return Ok(None);
        };
        let integrity = raw.parse::<Integrity>()?;
        let bytes = self.read_content(&integrity)?;
        Ok(Some((entry, bytes)))
    }
}
