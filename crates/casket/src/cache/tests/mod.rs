//! Cache unit tests, split by topic.

use super::*;
use serde_json::json;
use tempfile::{tempdir, TempDir};

mod content;
mod gc;

const CONTENT: &[u8] = b"foobarbaz";

fn new_cache() -> Result<(TempDir, Cache)> {
    let temp = tempdir()?;
    let cache = Cache::new(Some(temp.path().join("cache")))?;
    Ok((temp, cache))
}

fn seed(cache: &Cache, key: &str) -> Result<Entry> {
    cache.put(
        key,
        CONTENT,
        PutOptions {
            metadata: json!({"foo": "bar"}),
            ..PutOptions::default()
        },
    )
}

fn content_path_for(cache: &Cache, entry: &Entry) -> PathBuf {
    let integrity = entry
        .integrity
        .as_deref()
        .expect("live entry")
        .parse::<Integrity>()
        .expect("parse integrity");
    cache.content_path(&integrity).expect("content path")
}

fn append_record(bucket: &Path, entry: &Entry) -> Result<()> {
    let payload = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(bucket)?;
    file.write_all(format_record(&payload).as_bytes())?;
    Ok(())
}
