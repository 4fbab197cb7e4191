use super::*;

#[test]
fn orphaned_content_is_reclaimed() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let integrity = cache.write_content(Algorithm::Sha512, CONTENT)?;
    let path = cache.content_path(&integrity)?;

    let stats = cache.verify(&VerifyOptions::default())?;
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.reclaimed_size, CONTENT.len() as u64);
    assert_eq!(stats.bad_content_count, 0);
    assert_eq!(stats.missing_content, 0);
    assert_eq!(stats.verified_content, 0);
    assert_eq!(stats.total_entries, 0);
    assert!(!path.exists());
    Ok(())
}

#[test]
fn referenced_content_survives_the_sweep() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let entry = seed(&cache, "kept")?;
    cache.write_content(Algorithm::Sha512, b"orphan")?;

    let stats = cache.verify(&VerifyOptions::default())?;
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.total_entries, 1);
    assert!(content_path_for(&cache, &entry).exists());
    Ok(())
}

#[test]
fn junk_files_in_the_content_store_are_swept() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    seed(&cache, "kept")?;
    let junk = cache.content_root().join("sha512").join("zz");
    fs::create_dir_all(junk.parent().expect("algo directory"))?;
    fs::write(&junk, b"not a blob")?;

    let stats = cache.verify(&VerifyOptions::default())?;
    assert_eq!(stats.reclaimed_count, 1);
    assert_eq!(stats.reclaimed_size, 10);
    assert!(!junk.exists());
    Ok(())
}

#[test]
fn empty_directories_are_pruned() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let entry = cache.put("doomed", b"doomed", PutOptions::default())?;
    let path = content_path_for(&cache, &entry);
    cache.delete("doomed")?;

    cache.verify(&VerifyOptions::default())?;
    assert!(!path.exists());
    assert!(
        !cache.content_root().join("sha512").exists(),
        "emptied content shards are pruned"
    );
    assert!(
        !cache
            .bucket_path("doomed")
            .parent()
            .expect("index shard")
            .exists(),
        "emptied index shards are pruned"
    );
    Ok(())
}

#[test]
fn gc_on_an_empty_cache_is_a_no_op() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let stats = cache.verify(&VerifyOptions::default())?;
    assert_eq!(stats, VerifyStats {
        start_time: stats.start_time,
        end_time: stats.end_time,
        run_time: stats.run_time,
        ..VerifyStats::default()
    });
    Ok(())
}
