//! Timestamp-indexed block file
//!
//! The binary data file backing one attribute column. A fixed header of
//! three 4096-byte arrays (end offsets, timestamps, uncompressed lengths,
//! 512 big-endian i64 slots each) is followed by LZ4-compressed data
//! blocks. The header is rewritten in full on every append and is the
//! single durability point: a crash between payload append and header
//! rewrite leaves trailing garbage the next open ignores.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Size of one header array in bytes
pub const BUF_SIZE: usize = 4096;
/// Number of block slots per file
pub const NUM_ELEMENTS: usize = BUF_SIZE / 8;
/// Total header size preceding the first data block
pub const HEADER_SIZE: i64 = (BUF_SIZE * 3) as i64;

#[derive(Debug, Error)]
pub enum BlockFileError {
    #[error("corrupt header in {path}: got {got} of {expected} bytes")]
    CorruptHeader {
        path: PathBuf,
        got: usize,
        expected: usize,
    },

    #[error("block {0} is empty")]
    EmptyBlock(usize),

    #[error("decompressed block size does not match declared length {declared}")]
    ShortRead { declared: i64 },

    #[error("timestamp {0} not found")]
    NotFound(i64),

    #[error("timestamp {0} already exists in {1}")]
    DuplicateTimestamp(i64, PathBuf),

    #[error("file is full")]
    Full,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single attribute column on disk
pub struct BlockFile {
    path: PathBuf,

    // parallel slot arrays; a slot triple of all zeros is unused
    offsets: Vec<i64>,
    timestamps: Vec<i64>,
    lengths: Vec<i64>,

    // persistent read handle; kept to avoid reopening and, for
    // sequential reads, re-seeking
    read_file: Option<File>,
    last_seek_pos: i64,
}

impl BlockFile {
    /// Open an existing block file or create a fresh one with an empty
    /// header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BlockFileError> {
        let path = path.as_ref().to_path_buf();

        let mut header = vec![0u8; HEADER_SIZE as usize];
        if path.exists() {
            let mut f = File::open(&path)?;
            let mut got = 0;
            while got < header.len() {
                match f.read(&mut header[got..]) {
                    Ok(0) => {
                        return Err(BlockFileError::CorruptHeader {
                            path,
                            got,
                            expected: HEADER_SIZE as usize,
                        })
                    }
                    Ok(n) => got += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            let mut f = File::create(&path)?;
            f.write_all(&header)?;
            f.sync_all()?;
        }

        let mut offsets = vec![0i64; NUM_ELEMENTS];
        let mut timestamps = vec![0i64; NUM_ELEMENTS];
        let mut lengths = vec![0i64; NUM_ELEMENTS];
        for i in 0..NUM_ELEMENTS {
            offsets[i] = read_be_i64(&header, i * 8);
            timestamps[i] = read_be_i64(&header, BUF_SIZE + i * 8);
            lengths[i] = read_be_i64(&header, 2 * BUF_SIZE + i * 8);
        }

        Ok(Self {
            path,
            offsets,
            timestamps,
            lengths,
            read_file: None,
            last_seek_pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Timestamps of all occupied slots, in block order
    pub fn block_timestamps(&self) -> &[i64] {
        &self.timestamps[..self.blocks_used()]
    }

    /// Index of the lowest unused slot, i.e. the append point
    pub fn blocks_used(&self) -> usize {
        for i in 0..NUM_ELEMENTS {
            if self.slot_unused(i) {
                return i;
            }
        }
        NUM_ELEMENTS
    }

    fn slot_unused(&self, i: usize) -> bool {
        self.offsets[i] == 0 && self.timestamps[i] == 0 && self.lengths[i] == 0
    }

    /// Read and decompress block `i`
    pub fn read_block(&mut self, block: usize) -> Result<Vec<u8>, BlockFileError> {
        if block >= NUM_ELEMENTS || self.slot_unused(block) {
            return Err(BlockFileError::EmptyBlock(block));
        }

        let seek_pos = if block == 0 {
            HEADER_SIZE
        } else {
            self.offsets[block - 1]
        };
        let read_len = self.offsets[block] - seek_pos;

        if self.read_file.is_none() {
            self.read_file = Some(File::open(&self.path)?);
            self.last_seek_pos = 0;
        }
        let file = self.read_file.as_mut().unwrap();

        // sequential reads land exactly where the cursor already is
        if seek_pos != self.last_seek_pos {
            file.seek(SeekFrom::Start(seek_pos as u64))?;
        }

        let mut compressed = vec![0u8; read_len as usize];
        file.read_exact(&mut compressed)?;
        self.last_seek_pos = seek_pos + read_len;

        let declared = self.lengths[block];
        let decompressed = lz4_flex::block::decompress(&compressed, declared as usize)
            .map_err(|_| BlockFileError::ShortRead { declared })?;
        if decompressed.len() as i64 != declared {
            return Err(BlockFileError::ShortRead { declared });
        }
        Ok(decompressed)
    }

    /// Look up the block stored under `timestamp`
    pub fn read_timed_block(&mut self, timestamp: i64) -> Result<Vec<u8>, BlockFileError> {
        for i in 0..NUM_ELEMENTS {
            if self.timestamps[i] == timestamp {
                return self.read_block(i);
            }
        }
        Err(BlockFileError::NotFound(timestamp))
    }

    /// Compress `data` and append it as a new block under `timestamp`,
    /// then rewrite the header.
    pub fn write_timed_block(&mut self, timestamp: i64, data: &[u8]) -> Result<(), BlockFileError> {
        let mut slot = None;
        for i in 0..NUM_ELEMENTS {
            if self.timestamps[i] == timestamp {
                return Err(BlockFileError::DuplicateTimestamp(
                    timestamp,
                    self.path.clone(),
                ));
            }
            if self.slot_unused(i) {
                slot = Some(i);
                break;
            }
        }
        let slot = slot.ok_or(BlockFileError::Full)?;
        let block_start = if slot == 0 {
            HEADER_SIZE
        } else {
            self.offsets[slot - 1]
        };

        let compressed = lz4_flex::block::compress(data);

        // write at the recorded append point rather than the physical end
        // of the file, discarding any trailing garbage left by a crash
        // between a payload append and its header rewrite
        let mut wfile = OpenOptions::new().write(true).open(&self.path)?;
        wfile.seek(SeekFrom::Start(block_start as u64))?;
        wfile.write_all(&compressed)?;
        wfile.set_len(block_start as u64 + compressed.len() as u64)?;
        drop(wfile);

        self.offsets[slot] = block_start + compressed.len() as i64;
        self.timestamps[slot] = timestamp;
        self.lengths[slot] = data.len() as i64;

        self.rewrite_header()
    }

    fn rewrite_header(&self) -> Result<(), BlockFileError> {
        let mut header = vec![0u8; HEADER_SIZE as usize];
        for i in 0..NUM_ELEMENTS {
            write_be_i64(&mut header, i * 8, self.offsets[i]);
            write_be_i64(&mut header, BUF_SIZE + i * 8, self.timestamps[i]);
            write_be_i64(&mut header, 2 * BUF_SIZE + i * 8, self.lengths[i]);
        }

        let mut wfile = OpenOptions::new().write(true).open(&self.path)?;
        wfile.write_all(&header)?;
        wfile.sync_data()?;
        Ok(())
    }
}

fn read_be_i64(buf: &[u8], pos: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[pos..pos + 8]);
    i64::from_be_bytes(raw)
}

fn write_be_i64(buf: &mut [u8], pos: usize, value: i64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_open_creates_empty_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");

        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.blocks_used(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dip.gpf");

        let first = payload(10000);
        let second = payload(5000);
        {
            let mut file = BlockFile::open(&path).unwrap();
            file.write_timed_block(1000, &first).unwrap();
            file.write_timed_block(2000, &second).unwrap();
        }

        let mut file = BlockFile::open(&path).unwrap();
        assert_eq!(file.blocks_used(), 2);
        assert_eq!(file.read_timed_block(2000).unwrap(), second);
        assert_eq!(file.read_timed_block(1000).unwrap(), first);
    }

    #[test]
    fn test_blocks_used_increments_per_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::open(dir.path().join("proto.gpf")).unwrap();

        for (i, ts) in [100i64, 200, 300].iter().enumerate() {
            file.write_timed_block(*ts, &payload(64 * (i + 1))).unwrap();
            assert_eq!(file.blocks_used(), i + 1);
        }
    }

    #[test]
    fn test_sequential_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::open(dir.path().join("dport.gpf")).unwrap();

        for ts in 1..=8i64 {
            file.write_timed_block(ts, &payload(ts as usize * 100)).unwrap();
        }
        for (i, ts) in (1..=8i64).enumerate() {
            let data = file.read_block(i).unwrap();
            assert_eq!(data, payload(ts as usize * 100));
        }
    }

    #[test]
    fn test_empty_block_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::open(dir.path().join("pkts_sent.gpf")).unwrap();
        file.write_timed_block(42, &payload(128)).unwrap();

        assert!(matches!(
            file.read_block(1),
            Err(BlockFileError::EmptyBlock(1))
        ));
        assert!(matches!(
            file.read_timed_block(43),
            Err(BlockFileError::NotFound(43))
        ));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::open(dir.path().join("bytes_sent.gpf")).unwrap();
        file.write_timed_block(7, &payload(16)).unwrap();

        assert!(matches!(
            file.write_timed_block(7, &payload(16)),
            Err(BlockFileError::DuplicateTimestamp(7, _))
        ));
        assert_eq!(file.blocks_used(), 1);
    }

    #[test]
    fn test_file_full_after_all_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = BlockFile::open(dir.path().join("pkts_rcvd.gpf")).unwrap();

        for ts in 1..=NUM_ELEMENTS as i64 {
            file.write_timed_block(ts, &payload(8)).unwrap();
        }
        assert_eq!(file.blocks_used(), NUM_ELEMENTS);
        assert!(matches!(
            file.write_timed_block(10_000, &payload(8)),
            Err(BlockFileError::Full)
        ));
    }

    #[test]
    fn test_short_file_is_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes_rcvd.gpf");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        assert!(matches!(
            BlockFile::open(&path),
            Err(BlockFileError::CorruptHeader { got: 100, .. })
        ));
    }

    #[test]
    fn test_trailing_garbage_is_ignored_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");

        let data = payload(2048);
        {
            let mut file = BlockFile::open(&path).unwrap();
            file.write_timed_block(1, &data).unwrap();
        }
        // simulate a crash after payload append but before header rewrite
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"half-written block payload").unwrap();
        }

        let mut file = BlockFile::open(&path).unwrap();
        assert_eq!(file.blocks_used(), 1);
        assert_eq!(file.read_timed_block(1).unwrap(), data);

        // the next write lands at the recorded append point and reads fine
        file.write_timed_block(2, &payload(100)).unwrap();
        assert_eq!(file.blocks_used(), 2);
    }

    #[test]
    fn test_tampered_length_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dip.gpf");
        {
            let mut file = BlockFile::open(&path).unwrap();
            file.write_timed_block(5, &payload(4096)).unwrap();
        }

        // shrink the declared uncompressed length in the on-disk header
        {
            let mut f = OpenOptions::new().write(true).read(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(2 * BUF_SIZE as u64)).unwrap();
            f.write_all(&100i64.to_be_bytes()).unwrap();
        }

        let mut file = BlockFile::open(&path).unwrap();
        assert!(matches!(
            file.read_timed_block(5),
            Err(BlockFileError::ShortRead { declared: 100 })
        ));
    }
}
