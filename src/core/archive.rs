/// Tarball and directory-tree helpers shared by backup and restore

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Write `src` as a gzip tarball. Entries live under `prefix` when given,
/// otherwise paths are relative to `src` itself.
pub fn pack_dir(src: &Path, dest: &Path, prefix: Option<&str>) -> io::Result<()> {
    let encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let base = prefix.map(PathBuf::from).unwrap_or_default();
    if prefix.is_some() {
        builder.append_dir(&base, src)?;
    }

    for entry in WalkDir::new(src).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let name = base.join(relative);

        if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    builder.into_inner()?.finish()?.flush()?;
    Ok(())
}

/// Gzip tarball with no entries
pub fn pack_empty(dest: &Path) -> io::Result<()> {
    let encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::default());
    let builder = tar::Builder::new(encoder);
    builder.into_inner()?.finish()?.flush()?;
    Ok(())
}

pub fn unpack(archive: &Path, dest: &Path) -> io::Result<()> {
    let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest)
}

/// Recursive copy; `dest` is created if needed, existing files are replaced
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    fs::copy(src, target).map(|_| ())
}

/// Make `dest` an exact copy of `src`: delete first, then copy
pub fn mirror_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    copy_tree(src, dest)
}

/// Remove everything inside `dir` but keep `dir` (it may be a mount point)
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Total size in bytes of the regular files under `dir`
pub fn tree_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_pack_and_unpack_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("filestore");
        write(&src.join("ab/abcdef"), "attachment");
        write(&src.join("cd/cdef01"), "other");

        let archive = tmp.path().join("filestore.tar.gz");
        pack_dir(&src, &archive, None).unwrap();

        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        unpack(&archive, &out).unwrap();

        assert_eq!(fs::read_to_string(out.join("ab/abcdef")).unwrap(), "attachment");
        assert_eq!(fs::read_to_string(out.join("cd/cdef01")).unwrap(), "other");
    }

    #[test]
    fn test_empty_archive_unpacks_to_nothing() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("empty.tar.gz");
        pack_empty(&archive).unwrap();

        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        unpack(&archive, &out).unwrap();
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("bad.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();
        assert!(unpack(&archive, tmp.path()).is_err());
    }

    #[test]
    fn test_mirror_removes_stale_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        write(&src.join("module_a/__manifest__.py"), "{}");
        write(&dest.join("module_old/__manifest__.py"), "{}");

        let copied = mirror_tree(&src, &dest).unwrap();
        assert_eq!(copied, 1);
        assert!(dest.join("module_a/__manifest__.py").exists());
        assert!(!dest.join("module_old").exists());
    }

    #[test]
    fn test_clear_dir_keeps_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("filestore");
        write(&dir.join("ab/file"), "x");
        write(&dir.join("loose"), "y");

        clear_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
