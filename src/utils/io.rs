use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Create a uniquely named, owner-only file in `dir` holding `contents` and
/// keep it on disk. The caller owns removal.
pub fn write_private_file(dir: &Path, prefix: &str, contents: &[u8]) -> io::Result<PathBuf> {
    let mut file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    file.write_all(contents)?;
    file.flush()?;
    let (_file, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Remove a file if it exists. Returns whether something was removed;
/// a missing file is not an error.
pub fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Total size in bytes of the regular files below `root`. Entries that
/// vanish or cannot be read mid-walk are skipped.
pub fn dir_size(root: &Path) -> u64 {
    let mut total = 0;
    for entry in WalkDir::new(root) {
        let entry = match entry { Ok(e) => e, Err(_) => continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(md) = entry.metadata() {
            total += md.len();
        }
    }
    total
}
