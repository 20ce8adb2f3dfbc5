//! ZIP packaging of batch outputs.

use std::io::{self, Cursor, Write};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Errors that can occur while packaging an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive has no entries")]
    Empty,
}

/// Ordered output name to bytes mapping, packaged on demand.
///
/// Entries keep insertion order and names are stored as given, duplicates
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveBundle {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.entries.push((name.into(), bytes));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Writes all entries into a deflate-compressed ZIP.
    ///
    /// Every entry carries the same fixed timestamp, so equal bundles
    /// produce identical archives.
    pub fn package(&self) -> Result<Vec<u8>, ArchiveError> {
        if self.entries.is_empty() {
            return Err(ArchiveError::Empty);
        }

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in &self.entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(bytes)?;
        }
        let archive = zip.finish()?.into_inner();

        debug!(
            entries = self.entries.len(),
            bytes = archive.len(),
            "Archive packaged"
        );
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    #[test]
    fn test_entries_keep_order_and_content() {
        let mut bundle = ArchiveBundle::new();
        bundle.add("b.pdf", b"second".to_vec());
        bundle.add("a.pdf", b"first".to_vec());
        bundle.add("b.pdf", b"again".to_vec());

        let bytes = bundle.package().unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);

        let mut names = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            names.push((entry.name().to_string(), content));
        }
        assert_eq!(
            names,
            vec![
                ("b.pdf".to_string(), "second".to_string()),
                ("a.pdf".to_string(), "first".to_string()),
                ("b.pdf".to_string(), "again".to_string()),
            ]
        );
    }

    #[test]
    fn test_packaging_is_deterministic() {
        let mut bundle = ArchiveBundle::new();
        bundle.add("one.pdf", vec![1u8; 512]);
        bundle.add("two.pdf", vec![2u8; 512]);
        assert_eq!(bundle.package().unwrap(), bundle.package().unwrap());
    }

    #[test]
    fn test_empty_bundle() {
        assert!(matches!(
            ArchiveBundle::new().package(),
            Err(ArchiveError::Empty)
        ));
    }
}
