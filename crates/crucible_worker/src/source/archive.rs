//! Traversal-safe zip extraction.
//!
//! Every entry is vetted before a single byte lands on disk: entry count,
//! total uncompressed size (zip bombs), and path containment (`../` or
//! absolute paths never escape the extraction root).

use std::io::Cursor;
use std::path::Path;

use crucible_protocol::SourceSettings;
use zip::ZipArchive;

use super::SourceError;

pub fn extract_zip(bytes: &[u8], dest: &Path, settings: &SourceSettings) -> Result<(), SourceError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| SourceError::Rejected(format!("invalid zip archive: {e}")))?;

    if archive.len() > settings.max_file_count {
        return Err(SourceError::Rejected(format!(
            "zip contains {} entries (max: {})",
            archive.len(),
            settings.max_file_count
        )));
    }

    // Vet every entry before extracting any of them.
    let max_total_bytes = settings.max_uncompressed_size_mb * 1024 * 1024;
    let mut total_bytes = 0u64;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| SourceError::Rejected(format!("invalid zip entry: {e}")))?;

        if entry.enclosed_name().is_none() {
            return Err(SourceError::Rejected(format!(
                "malicious path in zip: {} (path traversal detected)",
                entry.name()
            )));
        }

        total_bytes = total_bytes.saturating_add(entry.size());
        if total_bytes > max_total_bytes {
            return Err(SourceError::Rejected(format!(
                "zip uncompressed size exceeds {} MB",
                settings.max_uncompressed_size_mb
            )));
        }
    }

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| SourceError::Rejected(format!("invalid zip entry: {e}")))?;
        // vetted above
        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => continue,
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn extracts_nested_entries() {
        let bytes = build_zip(&[
            ("Dockerfile", b"FROM scratch\n"),
            ("model/weights.bin", b"\x00\x01"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        extract_zip(&bytes, dir.path(), &SourceSettings::default()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap(),
            "FROM scratch\n"
        );
        assert_eq!(std::fs::read(dir.path().join("model/weights.bin")).unwrap(), b"\x00\x01");
    }

    #[test]
    fn path_traversal_is_rejected_without_extraction() {
        let bytes = build_zip(&[
            ("../../etc/passwd", b"root:x"),
            ("Dockerfile", b"FROM scratch\n"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(&bytes, dir.path(), &SourceSettings::default()).unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("path traversal"));
        // nothing may have been written
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn entry_count_cap() {
        let entries: Vec<(String, Vec<u8>)> =
            (0..5).map(|n| (format!("f{n}"), vec![0u8])).collect();
        let borrowed: Vec<(&str, &[u8])> =
            entries.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
        let bytes = build_zip(&borrowed);

        let mut settings = SourceSettings::default();
        settings.max_file_count = 4;
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(&bytes, dir.path(), &settings).unwrap_err();
        assert!(err.to_string().contains("entries"));
    }

    #[test]
    fn uncompressed_size_cap_stops_zip_bombs() {
        let big = vec![0u8; 2 * 1024 * 1024];
        let bytes = build_zip(&[("big.bin", big.as_slice())]);

        let mut settings = SourceSettings::default();
        settings.max_uncompressed_size_mb = 1;
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(&bytes, dir.path(), &settings).unwrap_err();
        assert!(err.to_string().contains("uncompressed size"));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn garbage_is_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(b"MZ this is not a zip", dir.path(), &SourceSettings::default())
            .unwrap_err();
        assert!(err.is_rejection());
    }
}
