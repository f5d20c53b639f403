//! Zip archives of exported datasets.

use std::fs::{self, File};
use std::path::Path;
use zip::ZipArchive;
use zip::result::ZipResult;

pub fn is_archive(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("zip"))
}

/// Unpack `archive` into `dest`, creating it if needed. Returns the number
/// of entries.
pub fn extract(archive: &Path, dest: &Path) -> ZipResult<usize> {
    fs::create_dir_all(dest)?;
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let entries = zip.len();
    zip.extract(dest)?;
    log::debug!(
        "Extracted {} entries from {} into {}",
        entries,
        archive.display(),
        dest.display()
    );
    Ok(entries)
}


#[cfg(test)]
mod tests {
    use super::test_support::write_zip;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_nested_entries() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("export.zip");
        write_zip(
            &archive,
            &[("annotations/default.json", b"{}"), ("images/a.txt", b"a")],
        );
        assert!(is_archive(&archive));

        let dest = temp_dir.path().join("out");
        assert_eq!(extract(&archive, &dest).unwrap(), 2);
        assert_eq!(fs::read_to_string(dest.join("annotations/default.json")).unwrap(), "{}");
    }

    #[test]
    fn test_directories_are_not_archives() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!is_archive(temp_dir.path()));
    }
}
