//! Content-store sweep: deletes blobs the rebuilt index no longer
//! references.

use super::*;

impl Cache {
    /// Delete every content file whose digest is not in `live`, then prune
    /// empty directories. Must run strictly after the index rebuild, or
    /// blobs referenced by soon-to-be-retained entries would be lost.
    pub(super) fn collect_garbage(
        &self,
        live: &HashSet<PathBuf>,
        options: &VerifyOptions,
        stats: &mut VerifyStats,
    ) -> Result<()> {
        let content_root = self.content_root();
        if !content_root.exists() {
            return Ok(());
        }

        let mut doomed = Vec::new();
        for entry in WalkDir::new(&content_root) {
            let entry = entry.with_context(|| {
                format!("failed to walk content store {}", content_root.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            match self.digest_from_content_path(&path) {
                Some(integrity) => {
                    let canonical = self.content_path(&integrity)?;
                    if !live.contains(&canonical) {
                        doomed.push(path);
                    }
                }
                None => {
                    // Not a derivable blob path; whatever it is, the store
                    // does not own it.
                    debug!(path = %path.display(), "content file with underivable digest");
                    doomed.push(path);
                }
            }
        }

        if !doomed.is_empty() {
            let workers = worker_count(options.concurrency, doomed.len());
            let (job_tx, job_rx) = mpsc::channel();
            for path in doomed {
                job_tx.send(path).expect("queue orphaned content");
            }
            drop(job_tx);

            let job_rx = Arc::new(Mutex::new(job_rx));
            let (result_tx, result_rx) = mpsc::channel();
            for _ in 0..workers {
                let options = options.clone();
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                thread::spawn(move || loop {
                    if is_cancelled(&options) {
                        break;
                    }
                    let path: PathBuf = {
                        let guard = job_rx.lock().expect("lock content receiver");
                        match guard.recv() {
                            Ok(path) => path,
                            Err(_) => break,
                        }
                    };
                    let outcome = remove_content_file(&path);
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                });
            }
            drop(result_tx);

            for outcome in result_rx {
                if let Some(size) = outcome? {
                    stats.reclaimed_count += 1;
                    stats.reclaimed_size += size;
                }
            }
        }

        self.prune_empty_dirs(&content_root)?;
        debug!(
            reclaimed_count = stats.reclaimed_count,
            reclaimed_size = stats.reclaimed_size,
            "content store swept"
        );
        Ok(())
    }
}

fn remove_content_file(path: &Path) -> Result<Option<u64>> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat orphaned content {}", path.display()))
        }
    };
    fs::remove_file(path)
        .with_context(|| format!("failed to delete orphaned content {}", path.display()))?;
    debug!(path = %path.display(), size, "orphaned content deleted");
    Ok(Some(size))
}
