// Binary file helpers
//
// Shader bytecode and the pipeline cache are plain binary blobs on disk.

use anyhow::{Context, Result};
use std::io::Cursor;
use std::path::Path;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a whole file into memory
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
}

/// Create (or truncate) a file and write `data` to it
pub fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, data).with_context(|| format!("Failed to write file: {:?}", path))
}

/// Load SPIR-V bytecode as 32-bit words in host byte order
pub fn read_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = read_file(path)?;

    // read_spv checks the word size and fixes up byte order from the magic
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .with_context(|| format!("Invalid SPIR-V in {:?}", path))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => anyhow::bail!("{:?} is not SPIR-V (magic {:#010x})", path, other),
        None => anyhow::bail!("{:?} is empty", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32], big_endian: bool) -> Vec<u8> {
        words
            .iter()
            .flat_map(|w| if big_endian { w.to_be_bytes() } else { w.to_le_bytes() })
            .collect()
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        write_file(&path, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(read_file(&path).unwrap(), vec![1, 2, 3, 4, 5]);

        // Writing again truncates
        write_file(&path, &[9]).unwrap();
        assert_eq!(read_file(&path).unwrap(), vec![9]);
    }

    #[test]
    fn missing_file_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.spv");
        let err = read_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.spv"));
    }

    #[test]
    fn spirv_in_either_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        let words = [SPIRV_MAGIC, 0x0001_0500, 7, 42];

        let little = dir.path().join("le.spv");
        write_file(&little, &words_to_bytes(&words, false)).unwrap();
        let big = dir.path().join("be.spv");
        write_file(&big, &words_to_bytes(&words, true)).unwrap();

        let expected = words.to_vec();
        if cfg!(target_endian = "little") {
            assert_eq!(read_spirv(&little).unwrap(), expected);
        }
        assert_eq!(read_spirv(&big).unwrap(), read_spirv(&little).unwrap());
    }

    #[test]
    fn spirv_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();

        let odd = dir.path().join("odd.spv");
        write_file(&odd, &[0x03, 0x02, 0x23, 0x07, 0x00]).unwrap();
        assert!(read_spirv(&odd).is_err());

        let wrong = dir.path().join("wrong.spv");
        write_file(&wrong, &words_to_bytes(&[0xdead_beef, 1], false)).unwrap();
        assert!(read_spirv(&wrong).is_err());

        let empty = dir.path().join("empty.spv");
        write_file(&empty, &[]).unwrap();
        assert!(read_spirv(&empty).is_err());
    }
}
