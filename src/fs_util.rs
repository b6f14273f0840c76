use filetime::FileTime;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Replace `path` with `content` atomically, creating missing parents.
///
/// The temp file lives in the target directory so the final rename stays on
/// one filesystem. The mtime is bumped afterwards so build tools watching
/// the tree notice same-second rewrites.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Path has no parent directory")
    })?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    filetime::set_file_mtime(path, FileTime::now())?;
    Ok(())
}

/// Remove a file if present. Missing files are not an error.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
