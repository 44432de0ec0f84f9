//! Deterministic directory archives.
//!
//! Entries are written in sorted order with zeroed mtimes, owners and fixed
//! modes, so archiving the same tree twice yields byte-identical output.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One file or directory below an archived root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// `/`-separated path relative to the root
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

/// Walk `root` and return its entries sorted by relative path. Symlinks and
/// special files are rejected; they cannot be restored faithfully.
pub fn walk(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    walk_into(root, root, &mut entries)?;
    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<TreeEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        let relative = path
            .strip_prefix(root)
            .map_err(|_| Error::CaptureCorrupt(format!("{} escapes {}", path.display(), root.display())))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        if meta.is_dir() {
            out.push(TreeEntry {
                relative,
                path: path.clone(),
                is_dir: true,
                size: 0,
                modified: meta.modified().ok(),
            });
            walk_into(root, &path, out)?;
        } else if meta.is_file() {
            out.push(TreeEntry {
                relative,
                path,
                is_dir: false,
                size: meta.len(),
                modified: meta.modified().ok(),
            });
        } else {
            return Err(Error::CaptureCorrupt(format!(
                "Unsupported file type at {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Archive `root` into an uncompressed tar at `dest`.
pub fn pack(root: &Path, dest: &Path, cancel: &CancellationToken) -> Result<PackStats> {
    let entries = walk(root)?;
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    let mut stats = PackStats::default();

    for entry in &entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if entry.is_dir {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &entry.relative, io::empty())?;
            stats.dirs += 1;
        } else {
            let mut file = File::open(&entry.path)?;
            // Size taken from the open handle, a file rewritten since the walk
            // would otherwise produce a short or long entry
            let size = file.metadata()?.len();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(size);
            builder.append_data(&mut header, &entry.relative, (&mut file).take(size))?;
            stats.files += 1;
            stats.bytes += size;
        }
    }

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_all()?;
    Ok(stats)
}

/// An entry seen while probing an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Read every entry of a tar stream to the end. Any truncation or header
/// corruption surfaces as an error.
pub fn probe<R: Read>(reader: R) -> Result<Vec<ProbedEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
        let is_dir = entry.header().entry_type().is_dir();
        let size = io::copy(&mut entry, &mut io::sink())?;
        if size != entry.size() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry {} is truncated", path),
            )));
        }
        entries.push(ProbedEntry { path, is_dir, size });
    }
    Ok(entries)
}

pub fn probe_file(path: &Path) -> Result<Vec<ProbedEntry>> {
    probe(BufReader::new(File::open(path)?))
}

/// Replace the contents of `target` with the archive at `archive_path`.
///
/// The archive is unpacked into a staging sibling first; `target` is swapped
/// only after the whole archive extracted cleanly.
pub fn unpack_replace(archive_path: &Path, target: &Path) -> Result<PackStats> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::RestoreFailed(format!("{} has no parent directory", target.display())))?;
    fs::create_dir_all(parent)?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restore".to_string());
    let token = uuid::Uuid::new_v4().simple().to_string();
    let staging = parent.join(format!(".{}.keeper-staging-{}", name, token));
    let previous = parent.join(format!(".{}.keeper-previous-{}", name, token));

    fs::create_dir_all(&staging)?;
    let stats = match unpack_in(archive_path, &staging) {
        Ok(stats) => stats,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, &previous)?;
    }
    if let Err(e) = fs::rename(&staging, target) {
        if had_previous {
            let _ = fs::rename(&previous, target);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if had_previous {
        fs::remove_dir_all(&previous)?;
    }
    Ok(stats)
}

fn unpack_in(archive_path: &Path, dest: &Path) -> Result<PackStats> {
    let mut archive = tar::Archive::new(BufReader::new(File::open(archive_path)?));
    archive.set_preserve_mtime(false);
    let mut stats = PackStats::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_dir = entry.header().entry_type().is_dir();
        let size = entry.size();
        // unpack_in refuses entries that would land outside `dest`
        if !entry.unpack_in(dest)? {
            return Err(Error::RestoreFailed(format!(
                "Archive entry escapes restore directory: {}",
                entry.path()?.display()
            )));
        }
        if is_dir {
            stats.dirs += 1;
        } else {
            stats.files += 1;
            stats.bytes += size;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("top.txt"), "top").unwrap();
        fs::write(root.join("a/one.bin"), vec![1u8; 1000]).unwrap();
        fs::write(root.join("a/b/two.txt"), "two").unwrap();
    }

    #[test]
    fn test_walk_sorted() {
        let temp = TempDir::new().unwrap();
        tree(temp.path());
        let rel: Vec<_> = walk(temp.path()).unwrap().into_iter().map(|e| e.relative).collect();
        assert_eq!(rel, vec!["a", "a/b", "a/b/two.txt", "a/one.bin", "empty", "top.txt"]);
    }

    #[test]
    fn test_pack_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        tree(&src);

        let first = temp.path().join("1.tar");
        let second = temp.path().join("2.tar");
        let stats = pack(&src, &first, &CancellationToken::new()).unwrap();
        // Touch mtimes: output must not change
        fs::write(src.join("top.txt"), "top").unwrap();
        pack(&src, &second, &CancellationToken::new()).unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.bytes, 1006);
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_pack_stops_when_cancelled() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        tree(&src);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pack(&src, &temp.path().join("x.tar"), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_probe_lists_entries() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        tree(&src);
        let tar = temp.path().join("x.tar");
        pack(&src, &tar, &CancellationToken::new()).unwrap();

        let entries = probe_file(&tar).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries
            .iter()
            .any(|e| e.path == "a/b/two.txt" && !e.is_dir && e.size == 3));
        assert!(entries.iter().any(|e| e.path == "empty" && e.is_dir));
    }

    #[test]
    fn test_probe_detects_truncation() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        tree(&src);
        let tar = temp.path().join("x.tar");
        pack(&src, &tar, &CancellationToken::new()).unwrap();

        let data = fs::read(&tar).unwrap();
        // Cut inside the 1000-byte body of a/one.bin (header at 1536, data at 2048)
        let cut = &data[..2548];
        assert!(probe(cut).is_err());
    }

    #[test]
    fn test_unpack_replace_swaps_contents() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        tree(&src);
        let tar = temp.path().join("x.tar");
        pack(&src, &tar, &CancellationToken::new()).unwrap();

        let target = temp.path().join("restored");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "old").unwrap();

        let stats = unpack_replace(&tar, &target).unwrap();
        assert_eq!(stats.files, 3);
        assert!(!target.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(target.join("a/b/two.txt")).unwrap(), "two");
        assert!(target.join("empty").is_dir());

        // No staging leftovers
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("keeper-"))
            .collect();
        assert!(leftovers.is_empty());

        // Re-packing the restored tree reproduces the archive
        let again = temp.path().join("again.tar");
        pack(&target, &again, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(&tar).unwrap(), fs::read(&again).unwrap());
    }

    #[test]
    fn test_failed_unpack_leaves_target_untouched() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.tar");
        fs::write(&bogus, vec![7u8; 1024]).unwrap();

        let target = temp.path().join("live");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), "keep").unwrap();

        assert!(unpack_replace(&bogus, &target).is_err());
        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "keep");
    }
}
