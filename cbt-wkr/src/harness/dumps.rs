//! Filtering and archiving of per-test dump directories.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Backend dumps and kernel sources are kept; everything else is noise.
pub fn is_kept_dump(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains("backend"));
    let is_kernel_source = path.extension().is_some_and(|ext| ext == "cl");
    name_matches || is_kernel_source
}

/// Reduce `dir` to the kept dumps, pack them into `<dir>.tar.gz` and remove
/// `dir`. Returns the archive path, or `None` when nothing was kept.
pub fn archive_dumps(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut kept = 0usize;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_kept_dump(entry.path()) {
            kept += 1;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }

    if kept == 0 {
        std::fs::remove_dir_all(dir)?;
        return Ok(None);
    }

    let archive = archive_path(dir);
    let file = File::create(&archive)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()?;
    std::fs::remove_dir_all(dir)?;

    debug!("Archived {} dump files into {}", kept, archive.display());
    Ok(Some(archive))
}

fn archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tar.gz");
    dir.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn archive_members(archive: &Path) -> Vec<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.header().entry_type().is_file())
            .map(|e| {
                e.path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_start_matches("./")
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_is_kept_dump() {
        assert!(is_kept_dump(Path::new("/tmp/x/a_backend.log")));
        assert!(is_kept_dump(Path::new("b.cl")));
        assert!(!is_kept_dump(Path::new("c.tmp")));
        assert!(!is_kept_dump(Path::new("backend/c.tmp")));
        assert!(!is_kept_dump(Path::new("kernel.clx")));
    }

    #[test]
    fn test_filter_and_archive() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("basic_test1_20240101000000");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a_backend.log"), "asm").unwrap();
        std::fs::write(dir.join("b.cl"), "kernel void k() {}").unwrap();
        std::fs::write(dir.join("c.tmp"), "junk").unwrap();
        std::fs::write(dir.join("nested/d_backend.bin"), "bin").unwrap();
        std::fs::write(dir.join("nested/e.txt"), "junk").unwrap();

        let archive = archive_dumps(&dir).unwrap().unwrap();
        assert_eq!(
            archive,
            root.path().join("basic_test1_20240101000000.tar.gz")
        );
        assert!(!dir.exists());
        assert_eq!(
            archive_members(&archive),
            vec!["a_backend.log", "b.cl", "nested/d_backend.bin"]
        );
    }

    #[test]
    fn test_empty_directory_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("empty");
        std::fs::create_dir(&dir).unwrap();

        assert_eq!(archive_dumps(&dir).unwrap(), None);
        assert!(!dir.exists());
    }

    #[test]
    fn test_only_noise_is_removed_without_archive() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("noise");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("c.tmp"), "junk").unwrap();

        assert_eq!(archive_dumps(&dir).unwrap(), None);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(archive_dumps(&root.path().join("absent")).unwrap(), None);
    }
}
