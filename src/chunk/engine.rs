use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use anyhow::Context;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, warn};

use super::{
    chunk_index, claim, decode_header, decode_table, Chunk, ChunkBuilder, TableEntry, HEADER_LEN,
    MARKER_LEN,
};
use crate::{
    config::{ReadMode, StoreConfig},
    error::{is_format_error, StoreError},
    fs::StoreDir,
    pool::BufferPool,
    store::Engine,
    value::{Op, Sizes, Value},
};

/// Chunk files listed oldest first.
async fn list_chunks<D>(dir: &D) -> anyhow::Result<Vec<(u64, String)>>
where
    D: StoreDir,
{
    let mut chunks: Vec<_> = dir
        .ls()
        .await?
        .into_iter()
        .filter_map(|name| chunk_index(&name).map(|i| (i, name)))
        .collect();
    chunks.sort();
    Ok(chunks)
}

/// A claimed chunk that never got its contents: exactly the marker, and
/// not a chunk.
fn is_abandoned_claim(len: usize, err: &anyhow::Error) -> bool {
    len == MARKER_LEN && is_format_error(err)
}

/// Keeps only the last op for every key, in the order those last ops were
/// issued.
fn collapse(ops: Vec<Op>) -> Vec<Op> {
    let last: HashMap<&str, usize> = ops
        .iter()
        .enumerate()
        .map(|(i, op)| (op.key.as_str(), i))
        .collect();
    let keep: HashSet<usize> = last.into_values().collect();
    ops.into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, op)| op)
        .collect()
}

#[derive(Debug)]
pub(crate) struct ChunkEngine<D> {
    dir: D,
    config: StoreConfig,
    small: ChunkBuilder,
    large: ChunkBuilder,
    pool: BufferPool,
}

impl<D> ChunkEngine<D>
where
    D: StoreDir,
{
    pub fn new(dir: D, config: StoreConfig) -> Self {
        let pool = BufferPool::new(config.block_size as usize);
        ChunkEngine {
            dir,
            config,
            small: ChunkBuilder::new(),
            large: ChunkBuilder::new(),
            pool,
        }
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        warn!(dir = ?self.dir, "resetting unreadable store");
        for (_, name) in list_chunks(&self.dir).await? {
            let dir = &self.dir;
            let name = name.as_str();
            self.config
                .retry
                .run("removing chunk", move || dir.unlink(name))
                .await?;
        }
        Ok(())
    }

    /// Fans chunk reads out over a bounded number of tasks. Completion order
    /// doesn't matter: a key only takes a chunk's entry if no newer chunk
    /// has already spoken for it.
    async fn read_chunks(&mut self, mode: ReadMode) -> anyhow::Result<BTreeMap<String, Value>> {
        let chunks = list_chunks(&self.dir).await?;
        let permits = Arc::new(Semaphore::new(self.config.read_concurrency));
        let mut tasks = JoinSet::new();
        for (index, name) in chunks.into_iter().rev() {
            let dir = self.dir.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                let data = dir
                    .read(&name)
                    .await?
                    .with_context(|| format!("chunk {} vanished while reading", name))?;
                let len = data.len();
                let chunk = Chunk::decode(data);
                anyhow::Ok((index, name, len, chunk))
            });
        }

        let mut resolved: HashMap<String, (u64, Option<Vec<u8>>)> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, name, len, chunk) = joined??;
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) if is_abandoned_claim(len, &e) => {
                    debug!(chunk = %name, "skipping abandoned chunk claim");
                    continue;
                }
                Err(e) => return Err(e.context(format!("decoding chunk {}", name))),
            };

            for entry in chunk.table() {
                if matches!(resolved.get(&entry.name), Some((seen, _)) if *seen > index) {
                    continue;
                }
                let value = chunk.value(entry).map(|v| {
                    let mut buf = self.pool.checkout(v.len());
                    buf.extend_from_slice(v);
                    buf
                });
                if let Some((_, Some(old))) = resolved.insert(entry.name.clone(), (index, value)) {
                    self.pool.give_back(old);
                }
            }
            self.pool.give_back(chunk.into_buffer());
        }

        let mut out = BTreeMap::new();
        for (key, (_, value)) in resolved {
            if let Some(buf) = value {
                out.insert(key, Value::decode(mode, buf, &mut self.pool)?);
            }
        }
        Ok(out)
    }

    async fn flush_builder(
        &mut self,
        large: bool,
        created: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        let builder = if large { &mut self.large } else { &mut self.small };
        if builder.is_empty() {
            return Ok(());
        }
        let entries = builder.entries();
        let encoded = builder.finish(&mut self.pool)?;

        let dir = &self.dir;
        let name = self
            .config
            .retry
            .run("claiming chunk", move || claim(dir))
            .await?;
        created.push(name.clone());
        dir.write(&name, &encoded).await?;
        debug!(chunk = %name, bytes = encoded.len(), entries, large, "flushed chunk");
        self.pool.give_back(encoded);
        Ok(())
    }

    async fn apply(&mut self, ops: Vec<Op>, created: &mut Vec<String>) -> anyhow::Result<()> {
        for op in collapse(ops) {
            let large = match &op.value {
                None => {
                    self.small.push_tombstone(op.key);
                    false
                }
                Some(value) => {
                    let bytes = value.encode()?;
                    let large = bytes.len() >= self.config.large_value_threshold;
                    let builder = if large { &mut self.large } else { &mut self.small };
                    builder.push(op.key, &bytes);
                    large
                }
            };
            let builder = if large { &self.large } else { &self.small };
            if builder.staged_len() >= self.config.max_chunk_size {
                self.flush_builder(large, created).await?;
            }
        }
        self.flush_builder(false, created).await?;
        self.flush_builder(true, created).await
    }
}

impl<D> Engine for ChunkEngine<D>
where
    D: StoreDir,
{
    async fn read(&mut self, mode: ReadMode) -> anyhow::Result<BTreeMap<String, Value>> {
        match self.read_chunks(mode).await {
            Ok(map) => Ok(map),
            Err(e) if is_format_error(&e) => {
                warn!(error = %e, "store data unreadable");
                self.reset().await?;
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&mut self, ops: Vec<Op>) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.dir.mkdir().await?;

        let mut created = Vec::new();
        let result = self.apply(ops, &mut created).await;
        if result.is_err() {
            self.small = ChunkBuilder::new();
            self.large = ChunkBuilder::new();
            for name in created {
                if let Err(e) = self.dir.unlink(&name).await {
                    warn!(chunk = %name, error = %e, "could not remove chunk of failed batch");
                }
            }
        }
        result
    }

    /// Live bytes are the newest non-tombstone entry per key; total counts
    /// every entry still on disk, a tombstone weighing as much as its key.
    /// Only headers and tables are read.
    async fn sizes(&mut self) -> anyhow::Result<Sizes> {
        let mut seen = HashSet::new();
        let mut sizes = Sizes::default();
        for (_, name) in list_chunks(&self.dir).await?.into_iter().rev() {
            let Some(table) = self.read_table(&name).await? else {
                continue;
            };
            for entry in table {
                sizes.total += if entry.is_tombstone() {
                    entry.name.len() as u64
                } else {
                    entry.len()
                };
                if seen.insert(entry.name.clone()) {
                    sizes.live += entry.len();
                }
            }
        }
        Ok(sizes)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<D> ChunkEngine<D>
where
    D: StoreDir,
{
    /// The table of chunk `name`, or `None` if the file is not a readable
    /// chunk.
    async fn read_table(&self, name: &str) -> anyhow::Result<Option<Vec<TableEntry>>> {
        let Some(stat) = self.dir.stat(name).await? else {
            return Ok(None);
        };
        let file_len = stat.len as usize;
        match self.decode_table_of(name, file_len).await {
            Ok(table) => Ok(Some(table)),
            Err(e) if is_format_error(&e) => {
                if !is_abandoned_claim(file_len, &e) {
                    warn!(chunk = %name, error = %e, "ignoring unreadable chunk in size estimate");
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn decode_table_of(
        &self,
        name: &str,
        file_len: usize,
    ) -> anyhow::Result<Vec<TableEntry>> {
        let head = self
            .dir
            .read_prefix(name, HEADER_LEN)
            .await?
            .unwrap_or_default();
        let (claimed_len, table_len) = decode_header(&head)?;
        if claimed_len != file_len as u64 {
            return Err(StoreError::format(format!(
                "chunk {} header claims {} bytes, file has {}",
                name, claimed_len, file_len
            ))
            .into());
        }
        let table_end = HEADER_LEN + table_len;
        let prefix = self
            .dir
            .read_prefix(name, table_end)
            .await?
            .unwrap_or_default();
        if prefix.len() < table_end {
            return Err(StoreError::format(format!("chunk {} table truncated", name)).into());
        }
        decode_table(&prefix[HEADER_LEN..], file_len - table_end)
    }
}
