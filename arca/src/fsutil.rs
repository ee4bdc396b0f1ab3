//! Small filesystem helpers shared by selection and restore commit.

use walkdir::WalkDir;

use std::fs;
use std::io;
use std::path::Path;

/// Total size of a file, or of every file under a directory
pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::other)?.len();
        }
    }
    Ok(total)
}

/// Recursively copies a directory tree (or single file)
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves a tree into place, falling back to copy+remove when the rename
/// crosses filesystems
pub fn move_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            if fs::symlink_metadata(src)?.is_dir() {
                fs::remove_dir_all(src)
            } else {
                fs::remove_file(src)
            }
        }
    }
}

/// Renders a byte count the way the summaries print one
pub fn size_to_human(size: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    if size < KIB {
        format!("{size} B")
    } else if size < MIB {
        format!("{:.1} KiB", size as f64 / KIB as f64)
    } else if size < GIB {
        format!("{:.1} MiB", size as f64 / MIB as f64)
    } else {
        format!("{:.1} GiB", size as f64 / GIB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    #[test]
    fn sizes_sum_over_trees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("a"))
            .unwrap()
            .write_all(&[0; 100])
            .unwrap();
        File::create(dir.path().join("sub/b"))
            .unwrap()
            .write_all(&[0; 50])
            .unwrap();
        assert_eq!(disk_usage(dir.path()).unwrap(), 150);
        assert_eq!(disk_usage(&dir.path().join("a")).unwrap(), 100);
    }

    #[test]
    fn move_tree_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file"), b"payload").unwrap();
        let dst = dir.path().join("dst");
        move_tree(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("nested/file")).unwrap(), b"payload");
    }

    #[test]
    fn human_sizes() {
        assert_eq!(size_to_human(512), "512 B");
        assert_eq!(size_to_human(2048), "2.0 KiB");
        assert_eq!(size_to_human(100 * 1024 * 1024), "100.0 MiB");
    }
}
