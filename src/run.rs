//! Reading and writing spilled runs: a temp file holding a sequence of `(key, value,
//! distinct-blob*)` tuples in ascending key order.
//!
//! Framing follows the same shape as the host project's disk-backed buffer records (a fixed
//! header, a checksummed body per record) but the schema itself — fixed-width key/value plus
//! varint-prefixed sorted distinct sequences — is this crate's own.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use snafu::{ResultExt, Snafu};

use crate::buffer::{KeyBuffer, ValueBuffer};

const MAGIC: [u8; 4] = *b"FBR1";
const VERSION: u16 = 1;

/// Errors raised while writing or reading a run file.
#[derive(Debug, Snafu)]
pub enum RunError {
    #[snafu(display("I/O error on run file: {source}"))]
    Io { source: io::Error },

    #[snafu(display("run file truncated while reading {what}"))]
    Truncated { what: &'static str },

    #[snafu(display(
        "run file corrupt: checksum mismatch (expected {expected:#010x}, got {actual:#010x})"
    ))]
    Corrupt { expected: u32, actual: u32 },

    #[snafu(display("run file has an unrecognized magic number or version"))]
    BadHeader,
}

impl From<io::Error> for RunError {
    fn from(source: io::Error) -> Self {
        RunError::Io { source }
    }
}

/// The fixed byte widths needed to parse a run written for one particular (keys, values,
/// distincts) `FieldList` triple.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub key_width: usize,
    pub value_width: usize,
    /// Width, in bytes, of each distinct field's member values, in field order.
    pub distinct_widths: Vec<usize>,
}

/// One record read back from a run: a bin's key, accumulated value, and per-distinct-field
/// sorted member sequences.
pub struct RunRecord {
    pub key: KeyBuffer,
    pub value: ValueBuffer,
    pub distincts: Vec<Vec<Box<[u8]>>>,
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint<R: Read>(reader: &mut R) -> Result<u64, RunError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                RunError::Truncated { what: "varint" }
            } else {
                RunError::Io { source: e }
            }
        })?;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Writes sorted bins to a temp file in the run format.
pub struct RunWriter {
    writer: BufWriter<File>,
}

impl RunWriter {
    pub fn create(path: &Path) -> Result<Self, RunError> {
        let file = File::create(path).context(IoSnafu)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&MAGIC).context(IoSnafu)?;
        writer.write_all(&VERSION.to_le_bytes()).context(IoSnafu)?;
        Ok(Self { writer })
    }

    /// Writes one `(key, value, distincts)` record. `distincts` must already be sorted
    /// ascending per field, as produced by [`crate::distinct::DistinctSet::into_sorted`].
    pub fn write_record(
        &mut self,
        key: &[u8],
        value: &[u8],
        distincts: &[Vec<Box<[u8]>>],
    ) -> Result<(), RunError> {
        let mut body = Vec::with_capacity(4 + key.len() + value.len());
        body.extend_from_slice(&(key.len() as u32).to_le_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(value);
        for members in distincts {
            write_varint(&mut body, members.len() as u64);
            for member in members {
                body.extend_from_slice(member);
            }
        }

        let mut crc = Crc32::new();
        crc.update(&body);
        let checksum = crc.finalize();

        self.writer.write_all(&body).context(IoSnafu)?;
        self.writer.write_all(&checksum.to_le_bytes()).context(IoSnafu)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), RunError> {
        self.writer.flush().context(IoSnafu)?;
        Ok(())
    }
}

/// Reads records back out of a run file, in the order they were written.
pub struct RunReader {
    reader: BufReader<File>,
    layout: RunLayout,
}

impl RunReader {
    pub fn open(path: &Path, layout: RunLayout) -> Result<Self, RunError> {
        let file = File::open(path).context(IoSnafu)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        let mut version = [0u8; 2];
        reader
            .read_exact(&mut magic)
            .map_err(|_| RunError::Truncated { what: "header magic" })?;
        reader
            .read_exact(&mut version)
            .map_err(|_| RunError::Truncated { what: "header version" })?;
        if magic != MAGIC || u16::from_le_bytes(version) != VERSION {
            return Err(RunError::BadHeader);
        }

        Ok(Self { reader, layout })
    }

    /// Reads the next record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<RunRecord>, RunError> {
        let mut key_len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut key_len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(RunError::Io { source: e }),
        }
        let key_len = u32::from_le_bytes(key_len_bytes) as usize;
        if key_len != self.layout.key_width {
            tracing::warn!(expected = self.layout.key_width, actual = key_len, "run file key width mismatch");
            return Err(RunError::Corrupt {
                expected: self.layout.key_width as u32,
                actual: key_len as u32,
            });
        }

        let mut body = Vec::new();
        body.extend_from_slice(&key_len_bytes);

        let mut key = vec![0u8; key_len];
        self.reader.read_exact(&mut key).map_err(|_| {
            tracing::warn!(what = "key", "run file truncated");
            RunError::Truncated { what: "key" }
        })?;
        body.extend_from_slice(&key);

        let mut value = vec![0u8; self.layout.value_width];
        self.reader.read_exact(&mut value).map_err(|_| {
            tracing::warn!(what = "value", "run file truncated");
            RunError::Truncated { what: "value" }
        })?;
        body.extend_from_slice(&value);

        let mut distincts = Vec::with_capacity(self.layout.distinct_widths.len());
        for &width in &self.layout.distinct_widths {
            let count = read_varint(&mut self.reader)? as usize;
            write_varint(&mut body, count as u64);
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let mut member = vec![0u8; width];
                self.reader.read_exact(&mut member).map_err(|_| {
                    tracing::warn!(what = "distinct member", "run file truncated");
                    RunError::Truncated { what: "distinct member" }
                })?;
                body.extend_from_slice(&member);
                members.push(member.into_boxed_slice());
            }
            distincts.push(members);
        }

        let mut checksum_bytes = [0u8; 4];
        self.reader.read_exact(&mut checksum_bytes).map_err(|_| {
            tracing::warn!(what = "checksum", "run file truncated");
            RunError::Truncated { what: "checksum" }
        })?;
        let expected = u32::from_le_bytes(checksum_bytes);

        let mut crc = Crc32::new();
        crc.update(&body);
        let actual = crc.finalize();
        if actual != expected {
            tracing::warn!(expected, actual, "run file checksum mismatch");
            return Err(RunError::Corrupt { expected, actual });
        }

        Ok(Some(RunRecord {
            key: KeyBuffer::from_bytes(&key),
            value: ValueBuffer::zeroed(value.len()).tap_set(&value),
            distincts,
        }))
    }
}

// Small helper so `RunRecord` construction above reads linearly; not part of the public API.
trait TapSet {
    fn tap_set(self, bytes: &[u8]) -> Self;
}

impl TapSet for ValueBuffer {
    fn tap_set(mut self, bytes: &[u8]) -> Self {
        self.as_mut_bytes().copy_from_slice(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_records_with_distincts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run0");
        let layout = RunLayout {
            key_width: 1,
            value_width: 8,
            distinct_widths: vec![4],
        };

        {
            let mut writer = RunWriter::create(&path).unwrap();
            let distincts = vec![vec![
                b"aaaa".to_vec().into_boxed_slice(),
                b"bbbb".to_vec().into_boxed_slice(),
            ]];
            writer.write_record(&[6u8], &10u64.to_ne_bytes(), &distincts).unwrap();
            writer.write_record(&[17u8], &5u64.to_ne_bytes(), &[vec![]]).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = RunReader::open(&path, layout).unwrap();
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.key.as_bytes(), &[6u8]);
        assert_eq!(u64::from_ne_bytes(first.value.as_bytes().try_into().unwrap()), 10);
        assert_eq!(first.distincts[0].len(), 2);

        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.key.as_bytes(), &[17u8]);
        assert!(second.distincts[0].is_empty());

        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn detects_checksum_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run1");
        let layout = RunLayout {
            key_width: 1,
            value_width: 8,
            distinct_widths: vec![],
        };

        {
            let mut writer = RunWriter::create(&path).unwrap();
            writer.write_record(&[6u8], &10u64.to_ne_bytes(), &[]).unwrap();
            writer.finish().unwrap();
        }

        // Flip a byte in the value payload, after the header and key_len+key.
        let mut bytes = std::fs::read(&path).unwrap();
        let corrupt_at = bytes.len() - 4 /* checksum */ - 1;
        bytes[corrupt_at] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = RunReader::open(&path, layout).unwrap();
        assert!(matches!(reader.next_record(), Err(RunError::Corrupt { .. })));
    }

    #[test]
    fn detects_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run2");
        let layout = RunLayout {
            key_width: 1,
            value_width: 8,
            distinct_widths: vec![],
        };

        {
            let mut writer = RunWriter::create(&path).unwrap();
            writer.write_record(&[6u8], &10u64.to_ne_bytes(), &[]).unwrap();
            writer.finish().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, bytes).unwrap();

        let mut reader = RunReader::open(&path, layout).unwrap();
        assert!(matches!(reader.next_record(), Err(RunError::Truncated { .. })));
    }
}
