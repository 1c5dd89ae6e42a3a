//! Binary storage for the vector store.
//!
//! File format: vectors.bin
//!
//! Header (15 bytes):
//! - version: u8 (1)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of the header fields before it)
//!
//! Entries (repeated, in insertion order):
//! - id_len: u16 (little-endian)
//! - id: [u8; id_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::galaxy::store::{StoreError, StoreSnapshot, VectorStore};

const FORMAT_VERSION: u8 = 1;

/// version(1) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 15;

pub const VECTORS_FILE_NAME: &str = "vectors.bin";

#[derive(Debug, thiserror::Error)]
pub enum VectorFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct VectorFile {
    path: PathBuf,
}

impl VectorFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(base_dir: &Path) -> Self {
        Self::new(base_dir.join(VECTORS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load every entry into a new store.
    pub fn load(&self) -> Result<VectorStore, VectorFileError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        let dimensions = header.dimensions as usize;
        let store = VectorStore::new(dimensions);

        for _ in 0..header.entry_count {
            let (id, vector) = read_entry(&mut reader, dimensions)?;
            store.insert(id, vector)?;
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorFileError::InvalidFormat(
                "trailing bytes after last entry".to_string(),
            ));
        }

        Ok(store)
    }

    /// Save a snapshot.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<(), VectorFileError> {
        let dimensions = u16::try_from(snapshot.dimensions()).map_err(|_| {
            VectorFileError::InvalidFormat(format!(
                "{} dimensions do not fit the file header",
                snapshot.dimensions()
            ))
        })?;

        let temp_path = self.path.with_extension("tmp");
        let result = write_to_file(&temp_path, snapshot, dimensions);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    dimensions: u16,
    entry_count: u64,
}

fn write_to_file(path: &Path, snapshot: &StoreSnapshot, dimensions: u16) -> Result<(), VectorFileError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..3].copy_from_slice(&dimensions.to_le_bytes());
    header_bytes[3..11].copy_from_slice(&(snapshot.len() as u64).to_le_bytes());
    let checksum = crc32fast::hash(&header_bytes[0..11]);
    header_bytes[11..15].copy_from_slice(&checksum.to_le_bytes());
    writer.write_all(&header_bytes)?;

    for entry in snapshot.entries() {
        let id = entry.item_id.as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| {
            VectorFileError::InvalidFormat(format!("item id of {} bytes is too long", id.len()))
        })?;
        writer.write_all(&id_len.to_le_bytes())?;
        writer.write_all(id)?;
        for &value in entry.vector.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorFileError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorFileError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[11],
        header_bytes[12],
        header_bytes[13],
        header_bytes[14],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..11]) {
        return Err(VectorFileError::ChecksumMismatch);
    }

    let dimensions = u16::from_le_bytes([header_bytes[1], header_bytes[2]]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[3..11]);

    Ok(Header {
        dimensions,
        entry_count: u64::from_le_bytes(count_bytes),
    })
}

fn read_entry(reader: &mut impl Read, dimensions: usize) -> Result<(String, Vec<f32>), VectorFileError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;
    let mut id = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut id)?;
    let id = String::from_utf8(id)
        .map_err(|_| VectorFileError::InvalidFormat("item id is not UTF-8".to_string()))?;

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }

    Ok((id, embedding))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(entries: &[(&str, [f32; 3])]) -> VectorStore {
        let store = VectorStore::new(3);
        for (id, vector) in entries {
            store.insert(*id, vector.to_vec()).unwrap();
        }
        store
    }

    #[test]
    fn test_empty_store_reloads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::in_dir(tmp.path());

        file.save(&VectorStore::new(384).snapshot()).unwrap();
        assert!(file.exists());

        let loaded = file.load().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions(), 384);
    }

    #[test]
    fn test_entries_reload_in_insertion_order() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::in_dir(tmp.path());
        let store = store_with(&[
            ("a", [1.0, 0.0, 0.0]),
            ("ünïcode", [0.0, 1.0, 0.0]),
            ("c", [0.0, 0.0, -1.5]),
        ]);

        file.save(&store.snapshot()).unwrap();
        let loaded = file.load().unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.fingerprint(), store.fingerprint());
        assert_eq!(loaded.get("c").unwrap().as_ref(), &[0.0, 0.0, -1.5]);
        let order: Vec<String> = loaded
            .snapshot()
            .entries()
            .iter()
            .map(|e| e.item_id.to_string())
            .collect();
        assert_eq!(order, vec!["a", "ünïcode", "c"]);
    }

    #[test]
    fn test_corrupted_header() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::in_dir(tmp.path());
        file.save(&store_with(&[("a", [1.0, 2.0, 3.0])]).snapshot())
            .unwrap();

        let mut bytes = std::fs::read(file.path()).unwrap();
        bytes[4] ^= 0xFF;
        std::fs::write(file.path(), bytes).unwrap();

        assert!(matches!(file.load(), Err(VectorFileError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::in_dir(tmp.path());
        file.save(&store_with(&[("a", [1.0, 2.0, 3.0])]).snapshot())
            .unwrap();

        let bytes = std::fs::read(file.path()).unwrap();
        std::fs::write(file.path(), &bytes[..bytes.len() - 2]).unwrap();

        assert!(matches!(file.load(), Err(VectorFileError::Io(_))));
    }

    #[test]
    fn test_unknown_version() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::in_dir(tmp.path());
        std::fs::write(file.path(), [9u8; HEADER_SIZE]).unwrap();

        assert!(matches!(
            file.load(),
            Err(VectorFileError::VersionMismatch(9, FORMAT_VERSION))
        ));
    }

    #[test]
    fn test_failed_save_removes_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = VectorFile::new(tmp.path().join("missing").join("vectors.bin"));

        assert!(file.save(&VectorStore::new(3).snapshot()).is_err());
        assert!(!tmp.path().join("missing").exists());
    }
}
