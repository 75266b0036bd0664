//! Filesystem plumbing for checkpoints and resilvering transfers.
//!
//! A checkpoint is a plain recursive copy of a quiesced store
//! directory; the resilverer walks the copy and streams each file to
//! the target node.

use std::fs;
use std::path::{Path, PathBuf};

/// Recursively copy `source` into `target`. `target` must not exist.
pub fn copy_directory(source: &Path, target: &Path) -> std::io::Result<()> {
    if target.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("checkpoint target {} already exists", target.display()),
        ));
    }
    fs::create_dir_all(target)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_directory(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), destination)?;
        }
    }
    Ok(())
}

/// Every regular file under `root`, as paths relative to `root`, sorted
/// so transfers are deterministic.
pub fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk_into(root, Path::new(""), &mut found)?;
    found.sort();
    Ok(found)
}

fn walk_into(root: &Path, relative: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            walk_into(root, &child, found)?;
        } else {
            found.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_nested_directories() {
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("top.sst"), b"top").unwrap();
        fs::write(source.join("nested/deep.log"), b"deep").unwrap();

        let target = scratch.path().join("copy");
        copy_directory(&source, &target).unwrap();

        assert_eq!(fs::read(target.join("top.sst")).unwrap(), b"top");
        assert_eq!(fs::read(target.join("nested/deep.log")).unwrap(), b"deep");

        // refuse to clobber
        assert!(copy_directory(&source, &target).is_err());
    }

    #[test]
    fn walk_is_relative_and_sorted() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/2"), b"").unwrap();
        fs::write(root.join("a"), b"").unwrap();

        let files = walk_files(root).unwrap();
        assert_eq!(files, vec![PathBuf::from("a"), PathBuf::from("b/2")]);
    }
}
