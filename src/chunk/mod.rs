//! Self-describing chunk files for the chunk layout.
//!
//! ```text
//! 0    u32 LE  file length minus these 4 bytes
//! 4    u32 LE  table length T
//! 8    T bytes JSON array of {"name", "start", "end"}
//! 8+T  content
//! ```
//!
//! Table ranges are relative to the content start, end exclusive. A
//! tombstone has `start == end == -1`.

use std::ops::Range;

use anyhow::Context;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, fs::StoreDir, pool::BufferPool};

pub(crate) mod engine;

pub const HEADER_LEN: usize = 8;

/// Length of the random marker a claimed but unwritten chunk holds.
pub const MARKER_LEN: usize = 16;

pub fn chunk_name(index: u64) -> String {
    format!("chunk{:06}", index)
}

pub fn chunk_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("chunk")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub start: i64,
    pub end: i64,
}

impl TableEntry {
    pub fn tombstone(name: String) -> Self {
        TableEntry {
            name,
            start: -1,
            end: -1,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.start == -1 && self.end == -1
    }

    /// The content range of a live entry.
    pub fn range(&self) -> Option<Range<usize>> {
        if self.is_tombstone() {
            None
        } else {
            Some(self.start as usize..self.end as usize)
        }
    }

    pub fn len(&self) -> u64 {
        self.range().map_or(0, |r| r.len() as u64)
    }
}

/// Serializes a chunk into a buffer taken from `pool`.
pub fn encode(
    table: &[TableEntry],
    content: &[u8],
    pool: &mut BufferPool,
) -> anyhow::Result<Vec<u8>> {
    let table_json = serde_json::to_vec(table).context("encoding chunk table")?;
    let body = 4 + table_json.len() + content.len();
    let (body_len, table_len) = match (u32::try_from(body), u32::try_from(table_json.len())) {
        (Ok(b), Ok(t)) => (b, t),
        _ => {
            return Err(StoreError::Capacity {
                offset: 0,
                len: body as u64,
                capacity: u32::MAX as u64,
            }
            .into())
        }
    };

    let mut out = pool.checkout(4 + body);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&table_len.to_le_bytes());
    out.extend_from_slice(&table_json);
    out.extend_from_slice(content);
    Ok(out)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Parses the fixed header, returning the file length it claims and the
/// table length.
pub fn decode_header(buf: &[u8]) -> anyhow::Result<(u64, usize)> {
    if buf.len() < HEADER_LEN {
        return Err(
            StoreError::format(format!("chunk header truncated at {} bytes", buf.len())).into(),
        );
    }
    let file_len = read_u32(buf, 0) as u64 + 4;
    let table_len = read_u32(buf, 4) as usize;
    if (HEADER_LEN + table_len) as u64 > file_len {
        return Err(StoreError::format(format!(
            "chunk table of {} bytes overruns file of {} bytes",
            table_len, file_len
        ))
        .into());
    }
    Ok((file_len, table_len))
}

/// Parses and validates a table against the length of the content it
/// describes.
pub fn decode_table(buf: &[u8], content_len: usize) -> anyhow::Result<Vec<TableEntry>> {
    let table: Vec<TableEntry> = serde_json::from_slice(buf)
        .map_err(|e| StoreError::format(format!("chunk table is not valid JSON: {}", e)))?;
    for entry in &table {
        let valid = entry.is_tombstone()
            || (0 <= entry.start && entry.start <= entry.end && entry.end as usize <= content_len);
        if !valid {
            return Err(StoreError::format(format!(
                "chunk entry {} has range {}..{} outside {} content bytes",
                entry.name, entry.start, entry.end, content_len
            ))
            .into());
        }
    }
    Ok(table)
}

/// A decoded chunk. Values are served out of the file buffer.
#[derive(Debug)]
pub struct Chunk {
    table: Vec<TableEntry>,
    buf: Vec<u8>,
    content_start: usize,
}

impl Chunk {
    pub fn decode(buf: Vec<u8>) -> anyhow::Result<Self> {
        let (file_len, table_len) = decode_header(&buf)?;
        if file_len != buf.len() as u64 {
            return Err(StoreError::format(format!(
                "chunk header claims {} bytes, file has {}",
                file_len,
                buf.len()
            ))
            .into());
        }
        let content_start = HEADER_LEN + table_len;
        let table = decode_table(&buf[HEADER_LEN..content_start], buf.len() - content_start)?;
        Ok(Chunk {
            table,
            buf,
            content_start,
        })
    }

    pub fn table(&self) -> &[TableEntry] {
        &self.table
    }

    pub fn content(&self) -> &[u8] {
        &self.buf[self.content_start..]
    }

    pub fn value(&self, entry: &TableEntry) -> Option<&[u8]> {
        entry.range().map(|r| &self.content()[r])
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}

/// Stages entries for one chunk file.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    table: Vec<TableEntry>,
    content: Vec<u8>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, value: &[u8]) {
        let start = self.content.len() as i64;
        self.content.extend_from_slice(value);
        self.table.push(TableEntry {
            name,
            start,
            end: self.content.len() as i64,
        });
    }

    pub fn push_tombstone(&mut self, name: String) {
        self.table.push(TableEntry::tombstone(name));
    }

    pub fn staged_len(&self) -> usize {
        self.content.len()
    }

    pub fn entries(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Encodes what is staged and resets the builder.
    pub fn finish(&mut self, pool: &mut BufferPool) -> anyhow::Result<Vec<u8>> {
        let out = encode(&self.table, &self.content, pool)?;
        self.table.clear();
        self.content.clear();
        Ok(out)
    }
}

fn random_marker() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MARKER_LEN)
        .map(char::from)
        .collect()
}

/// Reserves the next chunk name in `dir`. The file is created exclusively
/// and stamped with a random marker that must read back unchanged, so two
/// writers never end up sharing a name.
pub async fn claim<D>(dir: &D) -> anyhow::Result<String>
where
    D: StoreDir,
{
    let next = dir
        .ls()
        .await?
        .iter()
        .filter_map(|name| chunk_index(name))
        .max()
        .map_or(0, |i| i + 1);
    let name = chunk_name(next);
    let marker = random_marker();

    if !dir.create_new(&name, marker.as_bytes()).await? {
        return Err(StoreError::ClaimRace { name }.into());
    }
    if dir.read(&name).await?.as_deref() != Some(marker.as_bytes()) {
        return Err(StoreError::ClaimRace { name }.into());
    }
    Ok(name)
}
