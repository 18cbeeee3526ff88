//! The public store: one engine behind an async mutex, plus compaction.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::ensure;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::{
    catalog::engine::CatalogEngine,
    chunk::engine::ChunkEngine,
    config::{Layout, ReadMode, StoreConfig},
    fs::StoreDir,
    value::{Op, Sizes, Value},
};

pub(crate) mod compact;

#[cfg(test)]
mod metamorphic_test;

/// What both physical layouts provide.
pub(crate) trait Engine: Send {
    /// The complete live map.
    fn read(
        &mut self,
        mode: ReadMode,
    ) -> impl Future<Output = anyhow::Result<BTreeMap<String, Value>>> + Send;

    /// Applies `ops` in order. Either the whole batch becomes durable or
    /// the engine forgets it.
    fn write(&mut self, ops: Vec<Op>) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn sizes(&mut self) -> impl Future<Output = anyhow::Result<Sizes>> + Send;

    /// Flushes and releases open files. The engine stays usable.
    fn close(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug)]
pub(crate) enum AnyEngine<D> {
    Catalog(CatalogEngine<D>),
    Chunk(ChunkEngine<D>),
}

impl<D> AnyEngine<D>
where
    D: StoreDir,
{
    pub fn new(dir: D, config: &StoreConfig) -> Self {
        match config.layout {
            Layout::Catalog => AnyEngine::Catalog(CatalogEngine::new(dir, config.clone())),
            Layout::Chunk => AnyEngine::Chunk(ChunkEngine::new(dir, config.clone())),
        }
    }
}

impl<D> Engine for AnyEngine<D>
where
    D: StoreDir,
{
    async fn read(&mut self, mode: ReadMode) -> anyhow::Result<BTreeMap<String, Value>> {
        match self {
            AnyEngine::Catalog(e) => e.read(mode).await,
            AnyEngine::Chunk(e) => e.read(mode).await,
        }
    }

    async fn write(&mut self, ops: Vec<Op>) -> anyhow::Result<()> {
        match self {
            AnyEngine::Catalog(e) => e.write(ops).await,
            AnyEngine::Chunk(e) => e.write(ops).await,
        }
    }

    async fn sizes(&mut self) -> anyhow::Result<Sizes> {
        match self {
            AnyEngine::Catalog(e) => e.sizes().await,
            AnyEngine::Chunk(e) => e.sizes().await,
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self {
            AnyEngine::Catalog(e) => e.close().await,
            AnyEngine::Chunk(e) => e.close().await,
        }
    }
}

/// An append-only key/value store living in the directory `name` under
/// `parent`.
///
/// Every operation holds the store's lock for its whole duration, so calls on
/// one instance never interleave. Separate instances share nothing; two
/// instances on the same path (or two processes) are not coordinated.
#[derive(Debug)]
pub struct Store<D: StoreDir> {
    parent: D,
    name: String,
    config: StoreConfig,
    engine: Mutex<AnyEngine<D>>,
    // Set when a compaction failed; the directories are checked again before
    // the next operation touches them.
    needs_repair: AtomicBool,
}

impl<D> Store<D>
where
    D: StoreDir,
{
    /// Opens the store, repairing whatever an interrupted compaction left
    /// behind. Nothing is read or created until first use.
    pub async fn open<N>(parent: D, name: N, config: StoreConfig) -> anyhow::Result<Self>
    where
        N: Into<String>,
    {
        config.validate()?;
        let name = name.into();
        ensure!(
            !name.is_empty() && !name.contains('/') && !name.contains('~'),
            "invalid store name {:?}",
            name
        );

        compact::recover(&parent, &name, &config.retry).await?;
        let engine = AnyEngine::new(parent.cd(&name), &config);
        Ok(Store {
            parent,
            name,
            config,
            engine: Mutex::new(engine),
            needs_repair: AtomicBool::new(false),
        })
    }

    async fn lock(&self) -> anyhow::Result<MutexGuard<'_, AnyEngine<D>>> {
        let mut engine = self.engine.lock().await;
        if self.needs_repair.load(Ordering::Acquire) {
            compact::recover(&self.parent, &self.name, &self.config.retry).await?;
            *engine = AnyEngine::new(self.dir(), &self.config);
            self.needs_repair.store(false, Ordering::Release);
        }
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The directory holding the current generation.
    pub fn dir(&self) -> D {
        self.parent.cd(&self.name)
    }

    /// Everything currently live, decoded per the configured read mode.
    /// Unreadable data is discarded and the store starts over empty.
    pub async fn read(&self) -> anyhow::Result<BTreeMap<String, Value>> {
        let mut engine = self.lock().await?;
        engine.read(self.config.read_mode).await
    }

    /// Applies `ops` in order, then compacts if the store has accumulated
    /// enough garbage. A failed automatic compaction leaves the previous
    /// generation in place and is only logged.
    pub async fn write<I>(&self, ops: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = Op>,
    {
        let ops: Vec<Op> = ops.into_iter().collect();
        let mut engine = self.lock().await?;
        engine.write(ops).await?;

        if self.config.auto_compact {
            let sizes = engine.sizes().await?;
            if compact::should_compact(&self.config, sizes) {
                if let Err(e) = self.compact_locked(&mut engine).await {
                    warn!(store = %self.name, error = %e, "automatic compaction failed");
                }
            }
        }
        Ok(())
    }

    /// Rewrites the live entries into a fresh generation and swaps it in.
    pub async fn compact(&self) -> anyhow::Result<()> {
        let mut engine = self.lock().await?;
        self.compact_locked(&mut engine).await
    }

    async fn compact_locked(&self, engine: &mut AnyEngine<D>) -> anyhow::Result<()> {
        let result = compact::run(&self.parent, &self.name, &self.config, engine).await;
        if result.is_err() {
            self.needs_repair.store(true, Ordering::Release);
        }
        result
    }

    pub async fn sizes(&self) -> anyhow::Result<Sizes> {
        let mut engine = self.lock().await?;
        engine.sizes().await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        let mut engine = self.lock().await?;
        engine.close().await
    }
}
