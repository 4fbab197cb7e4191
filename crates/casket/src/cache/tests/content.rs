use super::*;

#[test]
fn write_content_is_idempotent() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let first = cache.write_content(Algorithm::Sha512, CONTENT)?;
    let second = cache.write_content(Algorithm::Sha512, CONTENT)?;
    assert_eq!(first, second);
    assert_eq!(cache.read_content(&first)?, CONTENT);
    assert!(cache.has_content(&first)?);
    Ok(())
}

#[test]
fn read_rejects_corrupt_blobs() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let entry = seed(&cache, "corrupt")?;
    fs::write(content_path_for(&cache, &entry), b"tampered")?;

    let err = cache.get("corrupt").unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::IntegrityMismatch { .. })
        ),
        "corrupt content should surface a typed mismatch"
    );
    Ok(())
}

#[test]
fn content_paths_invert_to_digests() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let integrity = cache.write_content(Algorithm::Sha512, CONTENT)?;
    let path = cache.content_path(&integrity)?;

    let derived = cache
        .digest_from_content_path(&path)
        .expect("blob path derives its digest");
    assert_eq!(derived, integrity);
    assert_eq!(cache.content_path(&derived)?, path);
    Ok(())
}

#[test]
fn foreign_paths_do_not_derive_digests() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    assert!(cache
        .digest_from_content_path(&cache.content_root().join("sha512").join("junk"))
        .is_none());
    assert!(cache
        .digest_from_content_path(Path::new("/elsewhere/blob"))
        .is_none());
    Ok(())
}

#[test]
fn distinct_algorithms_store_distinct_blobs() -> Result<()> {
    let (_temp, cache) = new_cache()?;
    let strong = cache.write_content(Algorithm::Sha512, CONTENT)?;
    let weak = cache.write_content(Algorithm::Sha256, CONTENT)?;
    assert_ne!(cache.content_path(&strong)?, cache.content_path(&weak)?);
    assert_eq!(cache.read_content(&weak)?, CONTENT);
    Ok(())
}
