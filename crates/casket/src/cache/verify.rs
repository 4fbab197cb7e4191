//! Verification driver: fixed-order phases that repair the cache and
//! account for what they did.

use super::*;

impl Cache {
    /// Re-derive a consistent cache: sweep `tmp/`, rebuild the index from
    /// surviving bucket records, drop content the rebuilt index does not
    /// reference, and stamp the last-verified marker.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::RootUnusable`] when the root cannot be
    /// created, [`CacheError::Cancelled`] when `options.cancel` is raised,
    /// and propagates any unexpected I/O error. The marker is only written
    /// by runs that complete every phase.
    pub fn verify(&self, options: &VerifyOptions) -> Result<VerifyStats> {
        let mut stats = VerifyStats {
            start_time: timestamp_ms(),
            ..VerifyStats::default()
        };
        self.ensure_layout()?;
        self.fix_perms(options)?;
        check_cancelled(options)?;
        self.clean_tmp()?;
        check_cancelled(options)?;
        let live = self.rebuild_index(options, &mut stats)?;
        check_cancelled(options)?;
        self.collect_garbage(&live, options, &mut stats)?;
        check_cancelled(options)?;
        self.write_last_verified()?;
        stats.end_time = timestamp_ms();
        stats.run_time = stats.end_time.saturating_sub(stats.start_time);
        info!(
            total_entries = stats.total_entries,
            verified_content = stats.verified_content,
            reclaimed_count = stats.reclaimed_count,
            reclaimed_size = stats.reclaimed_size,
            run_time_ms = stats.run_time,
            "cache verification complete"
        );
        Ok(stats)
    }

    // Reserved hook for ownership/permission normalization.
    fn fix_perms(&self, _options: &VerifyOptions) -> Result<()> {
        Ok(())
    }

    /// Remove everything under `tmp/`, creating the directory when absent
    /// and never touching its siblings.
    fn clean_tmp(&self) -> Result<()> {
        let tmp = self.tmp_dir();
        let children = match fs::read_dir(&tmp) {
            Ok(children) => children,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&tmp)
                    .with_context(|| format!("failed to create {}", tmp.display()))?;
                return Ok(());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list tmp directory {}", tmp.display()))
            }
        };
        for child in children {
            let child =
                child.with_context(|| format!("failed to list tmp directory {}", tmp.display()))?;
            let path = child.path();
            let removal = if child
                .file_type()
                .with_context(|| format!("failed to stat {}", path.display()))?
                .is_dir()
            {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removal.with_context(|| format!("failed to remove {}", path.display()))?;
        }
        debug!(path = %tmp.display(), "tmp swept");
        Ok(())
    }

    /// Stamp the wall-clock end of a successful verification.
    fn write_last_verified(&self) -> Result<()> {
        let dest = self.root.join(LAST_VERIFIED_FILE);
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())
            .context("failed to create temp file for the last-verified marker")?;
        tmp.write_all(timestamp_ms().to_string().as_bytes())
            .context("failed to write the last-verified marker")?;
        tmp.persist(&dest)
            .map_err(|err| anyhow!("failed to persist {}: {err}", dest.display()))?;
        Ok(())
    }

    /// Epoch-milliseconds timestamp of the last successful verification,
    /// or `None` when the cache has never been verified.
    pub fn last_run(&self) -> Result<Option<u64>> {
        let path = self.root.join(LAST_VERIFIED_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let stamp = raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("malformed last-verified marker at {}", path.display()))?;
        Ok(Some(stamp))
    }
}
