//! Walks the records the kernel wrote into a branch-trace counter's data area.
//!
//! Record layout, as produced for `PERF_SAMPLE_BRANCH_STACK` samples:
//!
//! ```text
//! +---------+---------+---------+----------------+---------------------------+
//! | type:u32| misc:u16| size:u16| bnr:u64        | bnr x { from:u64, to:u64 } |
//! +---------+---------+---------+----------------+---------------------------+
//! ```
//!
//! Kernels that append a `flags:u64` word to each entry write 24-byte entries;
//! the stride is taken from the room the record leaves for them.
//! `size` covers the whole record, header included. The data comes from outside
//! this process and every length in it is checked against the slice before use.

use log::{trace, warn};
use perf_event_open_sys::bindings as sys;
use thiserror::Error;

pub const RECORD_HEADER_SIZE: usize = 8;
pub const BRANCH_ENTRY_SIZE: usize = 16;
pub const FLAGGED_BRANCH_ENTRY_SIZE: usize = 24;
const BRANCH_COUNT_SIZE: usize = 8;

const RECORD_SAMPLE: u32 = sys::PERF_RECORD_SAMPLE as u32;
const MISC_CPUMODE_MASK: u16 = sys::PERF_RECORD_MISC_CPUMODE_MASK as u16;
const MISC_USER: u16 = sys::PERF_RECORD_MISC_USER as u16;

/// Why a walk stopped before the end of the written data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("unexpected record type {record_type} at offset {offset}")]
    UnexpectedType { offset: usize, record_type: u32 },
    #[error("record at offset {offset} is not from user space (misc {misc:#06x})")]
    UnexpectedOrigin { offset: usize, misc: u16 },
    #[error("record at offset {offset} declares size {size}, too small to hold a branch count")]
    Undersized { offset: usize, size: u16 },
    #[error("record at offset {offset} runs past the end of the data ({available} bytes left)")]
    Truncated { offset: usize, available: usize },
    #[error("record at offset {offset} claims {branches} branches but has room for fewer")]
    BranchOverrun { offset: usize, branches: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

/// One validated sample record.
#[derive(Debug, Clone, Copy)]
pub struct SampleRecord<'a> {
    offset: usize,
    size: usize,
    branches: u64,
    stride: usize,
    entries: &'a [u8],
}

impl<'a> SampleRecord<'a> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn branch_count(&self) -> u64 {
        self.branches
    }

    /// Bytes per branch entry in this record: 16, or 24 with a flags word.
    pub fn entry_stride(&self) -> usize {
        self.stride
    }

    pub fn entries(&self) -> impl Iterator<Item = BranchEntry> + 'a {
        self.entries
            .chunks_exact(self.stride)
            .map(|raw| BranchEntry {
                from: read_u64(raw, 0),
                to: read_u64(raw, 8),
            })
    }
}

/// Forward-only cursor over the records in a data area.
///
/// Yields records until the data is exhausted or a record fails validation; a
/// failure is yielded once and the iterator is finished after that.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
        }
    }

    /// Offset of the next record to be read.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn next_record(&mut self) -> Result<SampleRecord<'a>, RecordError> {
        let offset = self.offset;
        let rest = &self.data[offset..];
        if rest.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated {
                offset,
                available: rest.len(),
            });
        }

        let record_type = read_u32(rest, 0);
        if record_type != RECORD_SAMPLE {
            return Err(RecordError::UnexpectedType {
                offset,
                record_type,
            });
        }
        let misc = read_u16(rest, 4);
        if misc & MISC_CPUMODE_MASK != MISC_USER {
            return Err(RecordError::UnexpectedOrigin { offset, misc });
        }

        let declared = read_u16(rest, 6);
        let size = usize::from(declared);
        if size < RECORD_HEADER_SIZE + BRANCH_COUNT_SIZE {
            return Err(RecordError::Undersized {
                offset,
                size: declared,
            });
        }
        if size > rest.len() {
            return Err(RecordError::Truncated {
                offset,
                available: rest.len(),
            });
        }

        let branches = read_u64(rest, RECORD_HEADER_SIZE);
        let room = size - RECORD_HEADER_SIZE - BRANCH_COUNT_SIZE;
        let span = |stride: usize| {
            usize::try_from(branches)
                .ok()
                .and_then(|n| n.checked_mul(stride))
                .filter(|len| *len <= room)
        };
        let (stride, entries_len) = span(FLAGGED_BRANCH_ENTRY_SIZE)
            .map(|len| (FLAGGED_BRANCH_ENTRY_SIZE, len))
            .or_else(|| span(BRANCH_ENTRY_SIZE).map(|len| (BRANCH_ENTRY_SIZE, len)))
            .ok_or(RecordError::BranchOverrun { offset, branches })?;

        let start = RECORD_HEADER_SIZE + BRANCH_COUNT_SIZE;
        self.offset += size;
        Ok(SampleRecord {
            offset,
            size,
            branches,
            stride,
            entries: &rest[start..start + entries_len],
        })
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<SampleRecord<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }
        let item = self.next_record();
        if item.is_err() {
            self.done = true;
        }
        Some(item)
    }
}

impl std::iter::FusedIterator for Records<'_> {}

/// What a walk over one data area produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceSummary {
    pub records: usize,
    pub branches: u64,
    /// Set when the walk ended on a bad record; `branches` is then a partial sum.
    pub stopped: Option<RecordError>,
}

impl TraceSummary {
    pub fn is_suspect(&self) -> bool {
        self.stopped.is_some()
    }
}

/// Sums the branch entries of every sample record in `data`.
pub fn parse_branch_trace(data: &[u8]) -> TraceSummary {
    let mut summary = TraceSummary::default();
    for item in Records::new(data) {
        match item {
            Ok(record) => {
                trace!(
                    "Sample record at {}: size {}, {} branches",
                    record.offset(),
                    record.size(),
                    record.branch_count()
                );
                for entry in record.entries() {
                    trace!("  branch {:#x} -> {:#x}", entry.from, entry.to);
                }
                summary.records += 1;
                summary.branches = summary.branches.saturating_add(record.branch_count());
            }
            Err(e) => {
                warn!(
                    "Stopped branch trace walk after {} records: {e}",
                    summary.records
                );
                summary.stopped = Some(e);
            }
        }
    }
    summary
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Builds one record with `entries` branch entries and the given header fields.
    pub(crate) fn record(record_type: u32, misc: u16, entries: u64) -> Vec<u8> {
        record_with_stride(record_type, misc, entries, BRANCH_ENTRY_SIZE)
    }

    /// Like [`record`], with a flags word after each pair when `stride` is 24.
    pub(crate) fn record_with_stride(
        record_type: u32,
        misc: u16,
        entries: u64,
        stride: usize,
    ) -> Vec<u8> {
        let size = RECORD_HEADER_SIZE + BRANCH_COUNT_SIZE + entries as usize * stride;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&record_type.to_ne_bytes());
        out.extend_from_slice(&misc.to_ne_bytes());
        out.extend_from_slice(&(size as u16).to_ne_bytes());
        out.extend_from_slice(&entries.to_ne_bytes());
        for i in 0..entries {
            out.extend_from_slice(&(0x40_0000 + i * 4).to_ne_bytes());
            out.extend_from_slice(&(0x40_1000 + i * 4).to_ne_bytes());
            if stride == FLAGGED_BRANCH_ENTRY_SIZE {
                out.extend_from_slice(&0x1u64.to_ne_bytes());
            }
        }
        out
    }

    pub(crate) fn user_sample(entries: u64) -> Vec<u8> {
        record(RECORD_SAMPLE, MISC_USER, entries)
    }
}
