//! Storage mechanisms behind the kernel handler.
//!
//! [`StreeStorage`] translates byte-addressed kernel I/O into tree entries:
//! entry index = offset / entry capacity, with read-modify-write for partial
//! entries and the pipeline applied to every value in transit.
//! [`RamdiskStorage`] replaces the whole backing stack for the
//! device-ramdisk test mode — no tree, no pipeline.

use crate::pipeline::{PipelineStage, decode_through, encode_through};
use sbd_error::{Result, SbdError};
use sbd_kmod::BlockStorage;
use sbd_store::Stree;
use tracing::trace;

/// Tree-backed storage with the pipeline in the data path.
pub struct StreeStorage<'a> {
    stree: &'a mut Stree,
    pipeline: &'a [Box<dyn PipelineStage>],
    entry_bytes: u64,
    device_size: u64,
}

impl<'a> StreeStorage<'a> {
    pub fn new(
        stree: &'a mut Stree,
        pipeline: &'a [Box<dyn PipelineStage>],
        device_size: u64,
    ) -> Self {
        let entry_bytes = stree.max_entry_bytes();
        Self {
            stree,
            pipeline,
            entry_bytes,
            device_size,
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SbdError::InvalidParameter("request range overflow".to_owned()))?;
        if end > self.device_size {
            return Err(SbdError::InvalidParameter(format!(
                "request {offset}+{len} is outside the device of {} bytes",
                self.device_size
            )));
        }
        Ok(())
    }

    /// Bytes held by the given entry; the last entry may be short.
    fn entry_len(&self, entry: u64) -> usize {
        let start = entry * self.entry_bytes;
        self.entry_bytes.min(self.device_size - start) as usize
    }

    /// Fetch and decode one entry, or a zero block when never written.
    fn fetch_entry(&mut self, entry: u64) -> Result<Vec<u8>> {
        let expected = self.entry_len(entry);
        match self.stree.read_entry(entry)? {
            Some(stored) => {
                let plain = decode_through(self.pipeline, stored)?;
                if plain.len() != expected {
                    return Err(SbdError::SanityFailure(format!(
                        "entry {entry} decoded to {} bytes, expected {expected}",
                        plain.len()
                    )));
                }
                Ok(plain)
            }
            None => Ok(vec![0_u8; expected]),
        }
    }

    fn store_entry(&mut self, entry: u64, plain: Vec<u8>) -> Result<()> {
        let encoded = encode_through(self.pipeline, plain)?;
        if encoded.len() as u64 > self.entry_bytes {
            return Err(SbdError::InvalidParameter(format!(
                "pipeline grew entry {entry} to {} bytes, beyond the entry capacity {}",
                encoded.len(),
                self.entry_bytes
            )));
        }
        self.stree.write_entry(entry, &encoded)
    }
}

impl BlockStorage for StreeStorage<'_> {
    fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.check_range(offset, u64::from(len))?;
        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = offset;
        let end = offset + u64::from(len);
        while cursor < end {
            let entry = cursor / self.entry_bytes;
            let within = (cursor % self.entry_bytes) as usize;
            let take = ((end - cursor) as usize).min(self.entry_len(entry) - within);
            let plain = self.fetch_entry(entry)?;
            out.extend_from_slice(&plain[within..within + take]);
            cursor += take as u64;
        }
        Ok(out)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut cursor = offset;
        let end = offset + data.len() as u64;
        while cursor < end {
            let entry = cursor / self.entry_bytes;
            let within = (cursor % self.entry_bytes) as usize;
            let take = ((end - cursor) as usize).min(self.entry_len(entry) - within);

            let chunk = &data[(cursor - offset) as usize..(cursor - offset) as usize + take];
            let plain = if within == 0 && take == self.entry_len(entry) {
                chunk.to_vec()
            } else {
                // partial entry: read-modify-write
                let mut plain = self.fetch_entry(entry)?;
                plain[within..within + take].copy_from_slice(chunk);
                plain
            };
            self.store_entry(entry, plain)?;
            cursor += take as u64;
        }
        Ok(())
    }

    fn discard(&mut self, offset: u64, len: u32) -> Result<()> {
        // space reclaim stays inside the engine; discarded ranges simply
        // keep their last contents
        trace!(target: "sbd::storage", event = "discard", offset = offset, len = len);
        self.check_range(offset, u64::from(len))
    }

    fn flush(&mut self) -> Result<()> {
        self.stree.sync()
    }
}

/// Plain memory block storage for the device-ramdisk test mode.
pub struct RamdiskStorage {
    bytes: Vec<u8>,
}

impl RamdiskStorage {
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self {
            bytes: vec![0_u8; size as usize],
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(usize, usize)> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| SbdError::InvalidParameter("request range overflow".to_owned()))?;
        if end > self.bytes.len() as u64 {
            return Err(SbdError::InvalidParameter(format!(
                "request {offset}+{len} is outside the ramdisk of {} bytes",
                self.bytes.len()
            )));
        }
        Ok((offset as usize, end as usize))
    }
}

impl BlockStorage for RamdiskStorage {
    fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let (start, end) = self.check_range(offset, u64::from(len))?;
        Ok(self.bytes[start..end].to_vec())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let (start, end) = self.check_range(offset, data.len() as u64)?;
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn discard(&mut self, offset: u64, len: u32) -> Result<()> {
        let (start, end) = self.check_range(offset, u64::from(len))?;
        self.bytes[start..end].fill(0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
