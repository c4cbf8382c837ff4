use std::{
    collections::HashSet,
    error::Error,
    io::ErrorKind,
    path::Path,
    time::Duration,
};

use diesel::SqliteConnection;

use crate::blob;
use crate::db;

/// Files younger than this are never swept: a staged file may still be
/// receiving bytes, and a fresh blob may have been promoted after the sweep
/// snapshotted the catalog keys. Sweeping such a blob would delete committed
/// data, not a leak.
const MIN_SWEEP_AGE: Duration = Duration::from_secs(60 * 60);

/// Purges expired tokens from the registry, then removes stale staged
/// uploads and orphan blobs (bytes on disk with no catalog row). Orphans are
/// a leak, not corruption: a crash between staging and promotion can always
/// produce them.
pub fn cleanup_once(conn: &SqliteConnection, root_path: &Path) -> Result<(), Box<dyn Error>> {
    log::debug!("cleaning up tokens and blobs");
    let n_tokens = db::delete_expired_tokens(conn)?;
    log::info!("deleted {} expired tokens", n_tokens);
    sweep_blobs(conn, root_path, MIN_SWEEP_AGE)
}

/// Walk the blob directory and delete anything the catalog doesn't know
/// about. Files younger than `min_age` are left alone: the sweep runs
/// concurrently with uploads, and the catalog snapshot predates the
/// directory walk, so a recent file can look unreferenced while its catalog
/// row is already committed.
pub fn sweep_blobs(
    conn: &SqliteConnection,
    root_path: &Path,
    min_age: Duration,
) -> Result<(), Box<dyn Error>> {
    let keys: HashSet<String> = db::get_storage_keys(conn)?.into_iter().collect();

    let entries = match std::fs::read_dir(root_path) {
        Ok(entries) => entries,
        // nothing has been uploaded yet
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let mut n = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        let age = entry
            .metadata()?
            .modified()?
            .elapsed()
            .unwrap_or_default();
        if age < min_age {
            continue;
        }

        if let Some(key) = name.strip_suffix(blob::STAGING_SUFFIX) {
            log::info!("removing stale staged upload for key {}", key);
            remove_blob_file(&path)?;
            n += 1;
        } else if !keys.contains(&name) {
            log::info!("removing orphan blob {}", name);
            remove_blob_file(&path)?;
            n += 1;
        }
    }
    log::info!("swept {} files from {}", n, root_path.to_string_lossy());
    Ok(())
}

/// Remove the file at the given path. If the path doesn't exist it will log
/// the error but returns a success otherwise.
fn remove_blob_file(path: &Path) -> Result<(), Box<dyn Error>> {
    match std::fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::error!(
                "Attempted to delete file at {} but didn't find anything.",
                path.to_string_lossy()
            );
            Ok(())
        }
        Err(err) => {
            log::error!("Could not remove file at {}: {err:?}", path.to_string_lossy());
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::Connection;

    #[test]
    fn sweep_removes_orphans_and_stale_staged_files() {
        let conn = SqliteConnection::establish(":memory:").unwrap();
        db::run_migrations(&conn).unwrap();
        db::create_file(
            &conn,
            db::CreateFile {
                filename: "kept.txt".to_string(),
                content_type: "text/plain".to_string(),
                storage_key: "kept-key".to_string(),
            },
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept-key"), b"referenced").unwrap();
        std::fs::write(dir.path().join("orphan-key"), b"orphan").unwrap();
        std::fs::write(dir.path().join("dead-key.part"), b"staged").unwrap();

        // a zero min age makes every file old enough to sweep
        sweep_blobs(&conn, dir.path(), Duration::from_secs(0)).unwrap();

        assert!(dir.path().join("kept-key").exists());
        assert!(!dir.path().join("orphan-key").exists());
        assert!(!dir.path().join("dead-key.part").exists());
    }

    #[test]
    fn fresh_staged_files_survive_the_sweep() {
        let conn = SqliteConnection::establish(":memory:").unwrap();
        db::run_migrations(&conn).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("live-key.part"), b"uploading").unwrap();

        sweep_blobs(&conn, dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(dir.path().join("live-key.part").exists());
    }

    #[test]
    fn freshly_promoted_blobs_survive_the_sweep() {
        let conn = SqliteConnection::establish(":memory:").unwrap();
        db::run_migrations(&conn).unwrap();

        // simulates an upload committed between the catalog snapshot and the
        // directory walk: the blob is on disk but the snapshot doesn't know
        // its key yet. The age guard must keep it.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("just-promoted-key"), b"committed").unwrap();

        sweep_blobs(&conn, dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(dir.path().join("just-promoted-key").exists());
    }

    #[test]
    fn sweep_of_missing_root_is_a_noop() {
        let conn = SqliteConnection::establish(":memory:").unwrap();
        db::run_migrations(&conn).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-created");
        sweep_blobs(&conn, &missing, Duration::from_secs(0)).unwrap();
    }
}
