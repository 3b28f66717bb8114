//! Shard write-ahead log
//!
//! Every sub-batch accepted by a shard is appended here before it touches
//! the in-memory point map.
//! Record format: [MAGIC][SEQUENCE][LEN][PAYLOAD][CRC32]
//! where PAYLOAD is the JSON encoding of a [`PointOperation`] and the CRC
//! covers SEQUENCE, LEN and PAYLOAD.
//!
//! On open, a torn or corrupted tail is cut off so new records are never
//! written behind garbage.

use crate::collection::types::PointOperation;
use crate::common::{crc32, Error, Result, WalSyncPolicy};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 4] = [0x4D, 0x56, 0x57, 0x31]; // "MVW1"
const HEADER_LEN: u64 = 4 + 8 + 4;
const CRC_LEN: u64 = 4;

#[derive(Debug, Clone)]
pub struct WalEntry {
    pub sequence: u64,
    pub operation: PointOperation,
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: WalSyncPolicy,
}

impl Wal {
    /// Open or create a WAL file, resuming after its last valid record.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (next_sequence, valid_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Truncating WAL {} to {} bytes (corrupted tail)",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next sequence number and byte length of the valid prefix.
    fn scan(path: &Path) -> Result<(u64, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut next_sequence = 0;
        let mut valid_len = 0;

        while let Ok(Some((entry, len))) = Self::read_entry_internal(&mut reader) {
            next_sequence = next_sequence.max(entry.sequence + 1);
            valid_len += len;
        }

        Ok((next_sequence, valid_len))
    }

    /// Append one sub-batch. Returns the sequence number assigned to it.
    pub fn append(&mut self, operation: &PointOperation) -> Result<u64> {
        let sequence = self.next_sequence;
        let payload = serde_json::to_vec(operation)?;

        self.write_entry(sequence, &payload)?;
        self.maybe_sync()?;
        self.next_sequence += 1;

        Ok(sequence)
    }

    fn write_entry(&mut self, sequence: u64, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Wal(format!("record too large: {} bytes", payload.len())))?;

        let mut record = Vec::with_capacity(payload.len() + (HEADER_LEN + CRC_LEN) as usize);
        record.extend_from_slice(&WAL_MAGIC);
        record.extend_from_slice(&sequence.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);

        let checksum = crc32(&record[WAL_MAGIC.len()..]);
        record.extend_from_slice(&checksum.to_le_bytes());

        self.writer.write_all(&record)?;
        Ok(())
    }

    /// Sync based on policy
    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Replay WAL entries in append order
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(WalEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);

        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some((entry, _))) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read a single record; returns it with its length on disk.
    fn read_entry_internal<R: Read>(reader: &mut R) -> Result<Option<(WalEntry, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != WAL_MAGIC {
            return Err(Error::Wal("Invalid WAL magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = Vec::with_capacity(12 + len);
        checksum_data.extend_from_slice(&seq_bytes);
        checksum_data.extend_from_slice(&len_bytes);
        checksum_data.extend_from_slice(&payload);

        if crc32(&checksum_data) != stored_checksum {
            return Err(Error::Wal("Checksum mismatch".into()));
        }

        let operation: PointOperation = serde_json::from_slice(&payload)
            .map_err(|e| Error::Wal(format!("undecodable record {}: {}", sequence, e)))?;

        Ok(Some((
            WalEntry {
                sequence,
                operation,
            },
            HEADER_LEN + len as u64 + CRC_LEN,
        )))
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
