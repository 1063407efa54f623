//! Flat little-endian persistence for index artifacts.
//!
//! All files are raw binary with no length prefix; shapes are known from
//! index metadata. Layout on disk: `cq_centers`, `pq_centers`, `id_<c>`,
//! `vector_<c>`, `posting_lists_size`.

use anyhow::{Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub fn write_f32s(path: &Path, values: &[f32]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_f32s(path: &Path) -> Result<Vec<f32>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    anyhow::ensure!(
        bytes.len() % 4 == 0,
        "{} is not a whole number of f32 values",
        path.display()
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn write_u64s(path: &Path, values: &[u64]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_u64s(path: &Path) -> Result<Vec<u64>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    anyhow::ensure!(
        bytes.len() % 8 == 0,
        "{} is not a whole number of u64 values",
        path.display()
    );
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

pub fn write_u8s(path: &Path, values: &[u8]) -> Result<()> {
    std::fs::write(path, values).with_context(|| format!("write {}", path.display()))
}

pub fn read_u8s(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centers");
        let values = vec![0.0f32, -1.5, 3.25, f32::MAX, f32::MIN_POSITIVE];
        write_f32s(&path, &values).unwrap();
        assert_eq!(read_f32s(&path).unwrap(), values);
        // Bit-exact little-endian layout, no prefix.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 20);
    }

    #[test]
    fn test_u64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids");
        let values = vec![0u64, 1, u64::MAX];
        write_u64s(&path, &values).unwrap();
        assert_eq!(read_u64s(&path).unwrap(), values);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, [0u8; 6]).unwrap();
        assert!(read_f32s(&path).is_err());
        assert!(read_u64s(&path).is_err());
    }
}
