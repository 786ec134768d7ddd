use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::debug;
use spv_types::{ExtendedHeader, Header, RETARGET_INTERVAL};

use crate::error::StoreError;

pub const RECORD_SIZE: u64 = Header::SIZE as u64;
/// Byte length of one full difficulty window of records.
pub const CHUNK_BYTES: usize = Header::SIZE * RETARGET_INTERVAL as usize;

/// Flat-file header store: record `i` occupies bytes `[80·i, 80·(i+1))`, so
/// the height of a record is its offset divided by 80.
///
/// A single `RwLock` serializes writers against readers, and the cached tip
/// is refreshed from the file length only after a write completes, so a
/// multi-header commit is never observable half-done.
///
/// The store does not validate what it writes; that is the caller's job.
#[derive(Debug)]
pub struct HeaderStore {
    path: PathBuf,
    state: RwLock<TipState>,
}

#[derive(Debug)]
struct TipState {
    tip: Option<u64>,
}

impl HeaderStore {
    /// Opens the header file, creating an empty one when absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
        }
        let tip = tip_from_len(std::fs::metadata(&path)?.len())?;
        debug!(target: "verifier", "opened {} at height {:?}", path.display(), tip);
        Ok(Self {
            path,
            state: RwLock::new(TipState { tip }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Height of the highest stored record, `None` for an empty file.
    pub fn tip_height(&self) -> Option<u64> {
        self.state.read().expect("store lock poisoned").tip
    }

    /// Reads one record; `None` past the end of the file.
    pub fn read_header(&self, height: u64) -> Result<Option<Header>, StoreError> {
        let _state = self.state.read().expect("store lock poisoned");
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(RECORD_SIZE * height))?;
        let mut buf = [0u8; Header::SIZE];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(Header::decode(&buf).expect("record is 80 bytes"))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one full difficulty window of records; `None` if the file ends
    /// before the window does.
    pub fn read_chunk(&self, epoch: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let _state = self.state.read().expect("store lock poisoned");
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(CHUNK_BYTES as u64 * epoch))?;
        let mut buf = vec![0u8; CHUNK_BYTES];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes exactly one record and publishes the refreshed tip.
    pub fn write_header(&self, height: u64, header: &Header) -> Result<(), StoreError> {
        let mut state = self.state.write().expect("store lock poisoned");
        let mut file = self.writable_file()?;
        write_record(&mut file, height, header)?;
        file.sync_data()?;
        state.tip = file_tip(&file)?;
        Ok(())
    }

    /// Writes a full difficulty window at its fixed offset.
    pub fn write_chunk(&self, epoch: u64, data: &[u8]) -> Result<(), StoreError> {
        if data.len() != CHUNK_BYTES {
            return Err(StoreError::ChunkSize {
                expected: CHUNK_BYTES,
                actual: data.len(),
            });
        }
        let mut state = self.state.write().expect("store lock poisoned");
        let mut file = self.writable_file()?;
        file.seek(SeekFrom::Start(CHUNK_BYTES as u64 * epoch))?;
        file.write_all(data)?;
        file.sync_data()?;
        state.tip = file_tip(&file)?;
        Ok(())
    }

    /// Writes every member of an assembled chain in ascending height order
    /// under one lock acquisition, then publishes the new tip. Readers see
    /// either none of the commit or all of it.
    pub fn commit(&self, chain: &[ExtendedHeader]) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.write().expect("store lock poisoned");
        let mut file = self.writable_file()?;
        for entry in chain {
            write_record(&mut file, entry.block_height, &entry.block_header)?;
        }
        file.sync_data()?;
        state.tip = file_tip(&file)?;
        Ok(state.tip)
    }

    /// Drops every record at `headers` and beyond. Only the bootstrapper
    /// uses this, to discard an invalid archive tail.
    pub(crate) fn truncate(&self, headers: u64) -> Result<(), StoreError> {
        let mut state = self.state.write().expect("store lock poisoned");
        let file = self.writable_file()?;
        file.set_len(RECORD_SIZE * headers)?;
        file.sync_data()?;
        state.tip = file_tip(&file)?;
        Ok(())
    }

    fn writable_file(&self) -> Result<File, StoreError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?)
    }
}

fn write_record(file: &mut File, height: u64, header: &Header) -> Result<(), StoreError> {
    file.seek(SeekFrom::Start(RECORD_SIZE * height))?;
    file.write_all(&header.encode())?;
    Ok(())
}

fn file_tip(file: &File) -> Result<Option<u64>, StoreError> {
    tip_from_len(file.metadata()?.len())
}

fn tip_from_len(len: u64) -> Result<Option<u64>, StoreError> {
    if len % RECORD_SIZE != 0 {
        return Err(StoreError::Corrupt(len));
    }
    Ok((len / RECORD_SIZE).checked_sub(1))
}
