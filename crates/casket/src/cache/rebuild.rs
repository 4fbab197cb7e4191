//! Index rebuild: the phase that decides what the cache still contains.
//!
//! Buckets are independent, so they fan out on a bounded worker pool.
//! Within a bucket, records are processed in file order: torn lines drop,
//! the caller's filter runs, the latest record per key wins, and every
//! survivor's blob is re-checked before the bucket is rewritten.

use super::*;

/// Content paths whose blobs already verified this run, mapped to their
/// verified sizes. Its keys double as the live set handed to the content
/// GC.
type VerifiedSet = Arc<Mutex<HashMap<PathBuf, u64>>>;

#[derive(Debug, Default)]
struct BucketStats {
    verified_content: u64,
    kept_size: u64,
    rejected_entries: u64,
    missing_content: u64,
    bad_content_count: u64,
    reclaimed_count: u64,
    reclaimed_size: u64,
    total_entries: u64,
}

impl Cache {
    /// Rewrite every bucket so it holds only live, integrity-checked
    /// entries. Returns the set of content paths the rebuilt index
    /// references.
    pub(super) fn rebuild_index(
        &self,
        options: &VerifyOptions,
        stats: &mut VerifyStats,
    ) -> Result<HashSet<PathBuf>> {
        let buckets = self.bucket_files()?;
        let verified: VerifiedSet = Arc::new(Mutex::new(HashMap::new()));
        let workers = worker_count(options.concurrency, buckets.len());

        let (job_tx, job_rx) = mpsc::channel();
        for bucket in buckets {
            job_tx.send(bucket).expect("queue buckets");
        }
        drop(job_tx);

        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel();
        for _ in 0..workers {
            let cache = self.clone();
            let options = options.clone();
            let verified = Arc::clone(&verified);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            thread::spawn(move || loop {
                if is_cancelled(&options) {
                    break;
                }
                let bucket = {
                    let guard = job_rx.lock().expect("lock bucket receiver");
                    match guard.recv() {
                        Ok(bucket) => bucket,
                        Err(_) => break,
                    }
                };
                let outcome = rebuild_bucket(&cache, &bucket, &options, &verified);
                if result_tx.send(outcome).is_err() {
                    break;
                }
            });
        }
        drop(result_tx);

        for outcome in result_rx {
            let delta = outcome?;
            stats.verified_content += delta.verified_content;
            stats.kept_size += delta.kept_size;
            stats.rejected_entries += delta.rejected_entries;
            stats.missing_content += delta.missing_content;
            stats.bad_content_count += delta.bad_content_count;
            stats.reclaimed_count += delta.reclaimed_count;
            stats.reclaimed_size += delta.reclaimed_size;
            stats.total_entries += delta.total_entries;
        }

        self.prune_empty_dirs(&self.index_root())?;
        debug!(
            total_entries = stats.total_entries,
            rejected_entries = stats.rejected_entries,
            verified_content = stats.verified_content,
            "index rebuilt"
        );
        let live = verified
            .lock()
            .expect("verified set lock")
            .keys()
            .cloned()
            .collect();
        Ok(live)
    }
}

fn rebuild_bucket(
    cache: &Cache,
    bucket: &Path,
    options: &VerifyOptions,
    verified: &VerifiedSet,
) -> Result<BucketStats> {
    let mut out = BucketStats::default();
    let raw = match fs::read_to_string(bucket) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read bucket {}", bucket.display()))
        }
    };

    let mut records = Vec::new();
    for entry in parse_bucket_lines(&raw) {
        // Tombstones are deletion markers, not entries; they bypass the
        // filter so a rejected tombstone cannot resurrect older records.
        let excluded = entry.integrity.is_some()
            && options.filter.as_ref().is_some_and(|filter| !filter(&entry));
        if excluded {
            out.rejected_entries += 1;
            continue;
        }
        records.push(entry);
    }

    // Last write wins per key; every shadowed record is a rejection.
    let mut keep: Vec<Entry> = Vec::new();
    let mut slot_by_key: HashMap<String, usize> = HashMap::new();
    for entry in records {
        match slot_by_key.get(&entry.key).copied() {
            Some(slot) => {
                out.rejected_entries += 1;
                if entry.time >= keep[slot].time {
                    keep[slot] = entry;
                }
            }
            None => {
                slot_by_key.insert(entry.key.clone(), keep.len());
                keep.push(entry);
            }
        }
    }
    keep.retain(|entry| entry.integrity.is_some());

    let mut survivors = Vec::new();
    for entry in keep {
        if verify_entry_content(cache, &entry, verified, &mut out)? {
            survivors.push(entry);
        }
    }

    if survivors.is_empty() {
        match fs::remove_file(bucket) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to delete empty bucket {}", bucket.display()))
            }
        }
        debug!(bucket = %bucket.display(), "bucket emptied");
        return Ok(out);
    }

    out.total_entries += survivors.len() as u64;
    let mut rendered = String::new();
    for entry in &survivors {
        let payload = serde_json::to_string(entry).context("failed to encode index entry")?;
        rendered.push_str(&format_record(&payload));
    }
    let mut tmp = NamedTempFile::new_in(cache.tmp_dir())
        .context("failed to create temp file for bucket rewrite")?;
    tmp.write_all(rendered.as_bytes())
        .with_context(|| format!("failed to rewrite bucket {}", bucket.display()))?;
    tmp.persist(bucket)
        .map_err(|err| anyhow!("failed to persist bucket {}: {err}", bucket.display()))?;
    debug!(bucket = %bucket.display(), entries = survivors.len(), "bucket rewritten");
    Ok(out)
}

/// Check one entry's blob. `Ok(true)` retains the entry; `Ok(false)`
/// rejects it with the stats updated; unexpected I/O errors propagate.
fn verify_entry_content(
    cache: &Cache,
    entry: &Entry,
    verified: &VerifiedSet,
    out: &mut BucketStats,
) -> Result<bool> {
    let Some(raw) = entry.integrity.as_deref() else {
        return Ok(false);
    };
    let resolved = raw
        .parse::<Integrity>()
        .map_err(anyhow::Error::from)
        .and_then(|integrity| Ok((cache.content_path(&integrity)?, integrity)));
    let (path, integrity) = match resolved {
        Ok(pair) => pair,
        Err(err) => {
            warn!(key = %entry.key, %err, "rejecting entry with unusable integrity");
            out.rejected_entries += 1;
            out.missing_content += 1;
            return Ok(false);
        }
    };

    // A digest that already verified this run skips only the byte-stream
    // re-check; the recorded size stands in for a fresh stat, and a
    // disagreeing entry size is still bad content.
    let memoized = verified
        .lock()
        .expect("verified set lock")
        .get(&path)
        .copied();
    if let Some(verified_size) = memoized {
        if entry.size.is_some_and(|expected| expected != verified_size) {
            verified.lock().expect("verified set lock").remove(&path);
            reject_bad_content(&path, verified_size, out)?;
            return Ok(false);
        }
        return Ok(true);
    }

    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            out.rejected_entries += 1;
            out.missing_content += 1;
            return Ok(false);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat content at {}", path.display()))
        }
    };
    let actual_size = meta.len();
    if entry.size.is_some_and(|expected| expected != actual_size) {
        reject_bad_content(&path, actual_size, out)?;
        return Ok(false);
    }

    let file = File::open(&path)
        .with_context(|| format!("failed to open content at {}", path.display()))?;
    if !integrity.check_reader(file)? {
        reject_bad_content(&path, actual_size, out)?;
        return Ok(false);
    }

    let mut verified = verified.lock().expect("verified set lock");
    if verified.insert(path, actual_size).is_none() {
        out.verified_content += 1;
        out.kept_size += actual_size;
    }
    Ok(true)
}

fn reject_bad_content(path: &Path, size: u64, out: &mut BucketStats) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), size, "deleted content failing its integrity check");
            out.bad_content_count += 1;
            out.reclaimed_count += 1;
            out.reclaimed_size += size;
        }
        // Another bucket referencing the same digest may have deleted the
        // blob first; it already took the reclaim counters.
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to delete corrupt content at {}", path.display())
            })
        }
    }
    out.rejected_entries += 1;
    out.missing_content += 1;
    Ok(())
}
