use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

/// unique scratch path next to `dest`, on the same filesystem so rename is atomic
pub fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.{}.tmp", name, uuid::Uuid::new_v4());
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(tmp_name),
        _ => PathBuf::from(tmp_name),
    }
}

/// write `dest` atomically: fill a temp sibling, fsync, rename, fsync parent
///
/// on error the temp file is removed and `dest` is left untouched.
pub fn write_atomic<F>(dest: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File, &Path) -> Result<()>,
{
    let tmp_path = temp_sibling(dest);
    let result = (|| {
        let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
        fill(&mut file, &tmp_path)?;
        file.sync_all().with_path(&tmp_path)?;
        drop(file);
        fs::rename(&tmp_path, dest).with_path(dest)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fsync_dir(parent),
        _ => fsync_dir(Path::new(".")),
    }
}
