use std::collections::BTreeMap;

use tracing::warn;

use super::Catalog;
use crate::{
    config::{ReadMode, StoreConfig},
    error::{is_format_error, StoreError},
    fs::StoreDir,
    pool::BufferPool,
    segment::{segment_index, Appender, SegmentReader},
    store::Engine,
    value::{Op, Sizes, Value},
};

/// Catalog plus fixed-size segments. The catalog is loaded on first use and
/// the directory is only created once something is written.
#[derive(Debug)]
pub(crate) struct CatalogEngine<D> {
    dir: D,
    config: StoreConfig,
    catalog: Option<Catalog>,
    appender: Option<Appender<D>>,
    pool: BufferPool,
}

impl<D> CatalogEngine<D>
where
    D: StoreDir,
{
    pub fn new(dir: D, config: StoreConfig) -> Self {
        let pool = BufferPool::new(config.block_size as usize);
        CatalogEngine {
            dir,
            config,
            catalog: None,
            appender: None,
            pool,
        }
    }

    fn fresh_catalog(&self) -> Catalog {
        Catalog::new(self.config.block_size, self.config.log_size)
    }

    async fn ensure_loaded(&mut self) {
        if self.catalog.is_none() {
            let catalog = match Catalog::load(&self.dir).await {
                Some(catalog) => catalog,
                None => self.fresh_catalog(),
            };
            self.catalog = Some(catalog);
        }
    }

    /// Forgets everything: drops the catalog and every segment.
    async fn reset(&mut self) -> anyhow::Result<()> {
        warn!(dir = ?self.dir, "resetting unreadable store");
        self.appender = None;
        for name in self.dir.ls().await? {
            if Catalog::is_file(&name) || segment_index(&name).is_some() {
                let dir = &self.dir;
                let name = name.as_str();
                self.config
                    .retry
                    .run("removing segment", move || dir.unlink(name))
                    .await?;
            }
        }
        self.catalog = Some(self.fresh_catalog());
        Ok(())
    }

    async fn read_entries(&mut self, mode: ReadMode) -> anyhow::Result<BTreeMap<String, Value>> {
        let CatalogEngine {
            dir, catalog, pool, ..
        } = self;
        let mut out = BTreeMap::new();
        let Some(catalog) = catalog else {
            return Ok(out);
        };

        let mut reader = SegmentReader::new(dir.clone(), catalog.log_size);
        for entry in catalog.entries_by_offset() {
            let mut buf = pool.checkout(entry.size as usize);
            reader.read_into(pool, entry.start, entry.size, &mut buf).await?;
            out.insert(entry.key.clone(), Value::decode(mode, buf, pool)?);
        }
        reader.finish(pool);
        Ok(out)
    }

    async fn apply(&mut self, ops: &[Op]) -> anyhow::Result<()> {
        let CatalogEngine {
            dir,
            config,
            catalog,
            appender,
            pool,
        } = self;
        let Some(catalog) = catalog else {
            return Ok(());
        };

        if ops.iter().any(|op| op.value.is_some()) {
            dir.mkdir().await?;
        }

        let mut dirty = false;
        for op in ops {
            let Some(value) = &op.value else {
                dirty |= catalog.delete(&op.key).is_some();
                continue;
            };
            dirty = true;

            let bytes = value.encode()?;
            let entry = catalog.put(&op.key, bytes.len() as u64);
            let appender = appender.get_or_insert_with(|| {
                Appender::new(dir.clone(), catalog.log_size, config.retry, entry.start)
            });
            if appender.cursor() != entry.start {
                return Err(StoreError::Cursor {
                    expected: entry.start,
                    actual: appender.cursor(),
                }
                .into());
            }
            appender.append(pool, &bytes).await?;
        }

        if !dirty {
            return Ok(());
        }
        if let Some(appender) = appender {
            appender.flush().await?;
        }
        catalog.persist(dir, &config.retry).await
    }
}

impl<D> Engine for CatalogEngine<D>
where
    D: StoreDir,
{
    async fn read(&mut self, mode: ReadMode) -> anyhow::Result<BTreeMap<String, Value>> {
        self.ensure_loaded().await;
        if let Some(appender) = &mut self.appender {
            appender.flush().await?;
        }
        match self.read_entries(mode).await {
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
        self.ensure_loaded().await;

        let mut result = self.apply(&ops).await;
        if matches!(&result, Err(e) if is_format_error(e)) {
            warn!("store data unreadable, rewriting batch into an empty store");
            self.reset().await?;
            result = self.apply(&ops).await;
        }
        if result.is_err() {
            // Whatever the batch did in memory is not on disk; start over
            // from the persisted catalog next time.
            self.appender = None;
            self.catalog = None;
        }
        result
    }

    async fn sizes(&mut self) -> anyhow::Result<Sizes> {
        self.ensure_loaded().await;
        Ok(self.catalog.as_ref().map_or_else(Sizes::default, |c| Sizes {
            live: c.live_bytes(),
            total: c.total_bytes(),
        }))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(appender) = &mut self.appender {
            appender.close(&mut self.pool).await?;
        }
        Ok(())
    }
}
