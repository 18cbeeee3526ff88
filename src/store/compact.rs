use anyhow::Context;
use tracing::{info, warn};

use super::{AnyEngine, Engine};
use crate::{
    config::{Layout, ReadMode, StoreConfig},
    error::StoreError,
    fs::StoreDir,
    retry::RetryPolicy,
    value::{Op, Sizes},
};

pub const COMPACT_SUFFIX: &str = "~compact";
pub const RETIRED_SUFFIX: &str = "~retired";

/// Dropped into a retired generation once its replacement is installed.
/// A retired directory without it is the only complete copy of the store.
const SUPERSEDED_MARKER: &str = "superseded";

fn staged_name(name: &str) -> String {
    format!("{}{}", name, COMPACT_SUFFIX)
}

fn retired_name(name: &str) -> String {
    format!("{}{}", name, RETIRED_SUFFIX)
}

/// Whether a store with these sizes has enough garbage to be worth
/// rewriting.
pub fn should_compact(config: &StoreConfig, sizes: Sizes) -> bool {
    match config.layout {
        Layout::Catalog => {
            let floor = (sizes.live as f64 * config.compact_multiplier) as u64;
            sizes.total > config.compact_min_bytes.max(floor)
        }
        Layout::Chunk => {
            sizes.total > 0 && (sizes.live as f64 / sizes.total as f64) < config.compact_ratio
        }
    }
}

async fn exists<D>(parent: &D, name: &str) -> anyhow::Result<bool>
where
    D: StoreDir,
{
    Ok(parent.stat(name).await?.is_some())
}

/// Puts the directories back into a consistent state after a compaction was
/// interrupted or could not be undone. The staged copy is only removed once
/// a live generation is back in place.
pub async fn recover<D>(parent: &D, name: &str, retry: &RetryPolicy) -> anyhow::Result<()>
where
    D: StoreDir,
{
    let staged = staged_name(name);
    let retired = retired_name(name);

    if exists(parent, &retired).await? {
        if exists(&parent.cd(&retired), SUPERSEDED_MARKER).await? {
            warn!(store = name, "removing retired generation");
            retry
                .run("removing retired store", || parent.remove_dir(&retired))
                .await?;
        } else {
            if exists(parent, name).await? {
                // Either the compacted copy of the retired data, or something
                // written while the swap was unresolved.
                warn!(store = name, "discarding generation of an unfinished swap");
                retry
                    .run("removing unfinished store", || parent.remove_dir(name))
                    .await?;
            }
            warn!(store = name, "restoring retired generation");
            retry
                .run("restoring retired store", || parent.rename(&retired, name))
                .await?;
        }
    }

    if exists(parent, &staged).await? {
        warn!(store = name, "removing unfinished compaction");
        retry
            .run("removing staged store", || parent.remove_dir(&staged))
            .await?;
    }
    Ok(())
}

/// Moves the staged generation into place. If that fails the old one is put
/// back and [`StoreError::SwapFailed`] is returned.
pub async fn swap<D>(parent: &D, name: &str, retry: &RetryPolicy) -> anyhow::Result<()>
where
    D: StoreDir,
{
    let staged = staged_name(name);
    let retired = retired_name(name);
    let swap_failed = || StoreError::SwapFailed {
        name: name.to_owned(),
    };

    let had_live = exists(parent, name).await?;
    if had_live {
        retry
            .run("retiring store", || parent.rename(name, &retired))
            .await
            .with_context(swap_failed)?;
    }

    if let Err(e) = retry
        .run("installing compacted store", || parent.rename(&staged, name))
        .await
    {
        if had_live {
            if let Err(restore) = retry
                .run("restoring retired store", || parent.rename(&retired, name))
                .await
            {
                warn!(store = name, error = %restore, "could not restore retired generation");
            }
        }
        return Err(e.context(swap_failed()));
    }

    if had_live {
        let retired_dir = parent.cd(&retired);
        let removed = async {
            retired_dir.write(SUPERSEDED_MARKER, b"").await?;
            retry
                .run("removing retired store", || parent.remove_dir(&retired))
                .await
        }
        .await;
        if let Err(e) = removed {
            // An unmarked leftover is restored on open, which holds the same
            // entries as the compacted copy.
            warn!(store = name, error = %e, "could not remove retired generation");
        }
    }
    Ok(())
}

/// Rewrites the live entries of `engine` into a sibling directory with a
/// fresh engine of the same layout, swaps it into place and reopens.
pub(crate) async fn run<D>(
    parent: &D,
    name: &str,
    config: &StoreConfig,
    engine: &mut AnyEngine<D>,
) -> anyhow::Result<()>
where
    D: StoreDir,
{
    let live = engine.read(ReadMode::Raw).await?;
    let before = engine.sizes().await?;

    let staged = staged_name(name);
    config
        .retry
        .run("clearing staged store", || parent.remove_dir(&staged))
        .await?;
    let staged_dir = parent.cd(&staged);
    staged_dir.mkdir().await?;

    let entries = live.len();
    let mut fresh = AnyEngine::new(staged_dir, config);
    let written = async {
        fresh
            .write(
                live.into_iter()
                    .map(|(key, value)| Op {
                        key,
                        value: Some(value),
                    })
                    .collect(),
            )
            .await?;
        fresh.close().await?;
        fresh.sizes().await
    }
    .await;
    let after = match written {
        Ok(after) => after,
        Err(e) => {
            if let Err(cleanup) = parent.remove_dir(&staged).await {
                warn!(store = name, error = %cleanup, "could not remove staged store");
            }
            return Err(e.context("writing compacted store"));
        }
    };

    engine.close().await?;
    let swapped = swap(parent, name, &config.retry).await;
    *engine = AnyEngine::new(parent.cd(name), config);
    if let Err(e) = swapped {
        if !exists(parent, name).await.unwrap_or(false) {
            // Neither generation is in place; the staged copy stays until
            // the retired one is restored.
            warn!(store = name, "store left between generations");
            return Err(e);
        }
        if let Err(cleanup) = parent.remove_dir(&staged).await {
            warn!(store = name, error = %cleanup, "could not remove staged store");
        }
        return Err(e);
    }

    info!(
        store = name,
        entries,
        live_bytes = before.live,
        total_before = before.total,
        total_after = after.total,
        "compacted store"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        fs::{MockDir, OsDir},
        store::Store,
        value::Value,
    };

    fn layouts() -> [StoreConfig; 2] {
        [
            StoreConfig::new(Layout::Catalog).log_size(64),
            StoreConfig::new(Layout::Chunk).max_chunk_size(64),
        ]
    }

    async fn churn<D: StoreDir>(store: &Store<D>) -> anyhow::Result<()> {
        for round in 0..5 {
            store
                .write((0..8).map(|i| Op::put(format!("k{}", i), format!("round{}-{}", round, i))))
                .await?;
        }
        store.write(vec![Op::delete("k0"), Op::delete("k1")]).await
    }

    #[test]
    fn trigger_policy() {
        let catalog = StoreConfig::new(Layout::Catalog);
        let mb = 1024 * 1024;
        assert!(!should_compact(&catalog, Sizes { live: mb, total: 6 * mb }));
        assert!(should_compact(&catalog, Sizes { live: mb, total: 6 * mb + 1 }));
        assert!(!should_compact(&catalog, Sizes { live: 8 * mb, total: 12 * mb }));
        assert!(should_compact(&catalog, Sizes { live: 8 * mb, total: 12 * mb + 1 }));

        let chunk = StoreConfig::new(Layout::Chunk);
        assert!(!should_compact(&chunk, Sizes { live: 0, total: 0 }));
        assert!(!should_compact(&chunk, Sizes { live: 6, total: 10 }));
        assert!(should_compact(&chunk, Sizes { live: 5, total: 10 }));
        assert!(should_compact(&chunk, Sizes { live: 0, total: 10 }));
    }

    #[tokio::test]
    async fn compaction_preserves_contents_and_shrinks() -> anyhow::Result<()> {
        for config in layouts() {
            let root = MockDir::new();
            let store = Store::open(root.clone(), "s", config.auto_compact(false)).await?;
            churn(&store).await?;

            let before = store.read().await?;
            let usage_before = root.fs().usage("s");
            store.compact().await?;
            assert_eq!(before, store.read().await?);
            assert!(root.fs().usage("s") <= usage_before);

            let sizes = store.sizes().await?;
            assert_eq!(sizes.live, sizes.total);
            assert_eq!(vec!["s".to_owned()], root.ls().await?);

            // Compacting a compacted store changes nothing.
            let usage = root.fs().usage("s");
            store.compact().await?;
            assert_eq!(before, store.read().await?);
            assert_eq!(usage, root.fs().usage("s"));

            store.write(vec![Op::put("new", "v")]).await?;
            assert_eq!(before.len() + 1, store.read().await?.len());
        }
        Ok(())
    }

    #[tokio::test]
    async fn automatic_compaction() -> anyhow::Result<()> {
        let config = StoreConfig::new(Layout::Catalog)
            .log_size(64)
            .compact_min_bytes(100);
        let root = MockDir::new();
        let store = Store::open(root.clone(), "s", config).await?;
        for i in 0..20 {
            store.write(vec![Op::put("k", format!("value-{:02}", i))]).await?;
        }
        let sizes = store.sizes().await?;
        assert!(sizes.total <= 100, "{:?}", sizes);
        assert_eq!(
            Some(b"value-19".as_slice()),
            store.read().await?["k"].as_bytes()
        );

        let config = StoreConfig::new(Layout::Chunk);
        let store = Store::open(root.clone(), "c", config).await?;
        store.write(vec![Op::put("a", "1"), Op::put("b", "2")]).await?;
        store.write(vec![Op::put("a", "3")]).await?;
        // live 2 of 3 bytes keeps it; one more overwrite tips it under 0.6.
        assert_eq!(Sizes { live: 2, total: 3 }, store.sizes().await?);
        store.write(vec![Op::put("b", "4")]).await?;
        assert_eq!(Sizes { live: 2, total: 2 }, store.sizes().await?);
        Ok(())
    }

    #[tokio::test]
    async fn failed_install_keeps_old_generation() -> anyhow::Result<()> {
        for config in layouts() {
            let root = MockDir::new();
            let config = config
                .auto_compact(false)
                .retry(RetryPolicy::new(2, Duration::from_millis(1)));
            let store = Store::open(root.clone(), "s", config.clone()).await?;
            churn(&store).await?;
            let before = store.read().await?;

            root.fs().fail_renames_from("s~compact", 2);
            let err = store.compact().await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::SwapFailed { .. })
            ));

            assert_eq!(vec!["s".to_owned()], root.ls().await?);
            assert_eq!(before, store.read().await?);
            let reopened = Store::open(root.clone(), "s", config).await?;
            assert_eq!(before, reopened.read().await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn transient_rename_failures_are_retried() -> anyhow::Result<()> {
        let root = MockDir::new();
        let config = StoreConfig::new(Layout::Chunk)
            .auto_compact(false)
            .retry(RetryPolicy::new(3, Duration::from_millis(1)));
        let store = Store::open(root.clone(), "s", config).await?;
        churn(&store).await?;
        let before = store.read().await?;

        root.fs().fail_renames_from("s", 2);
        root.fs().fail_renames_from("s~compact", 2);
        store.compact().await?;
        assert_eq!(before, store.read().await?);
        assert_eq!(vec!["s".to_owned()], root.ls().await?);
        Ok(())
    }

    #[tokio::test]
    async fn open_repairs_interrupted_swaps() -> anyhow::Result<()> {
        let root = MockDir::new();
        let config = StoreConfig::new(Layout::Catalog);
        {
            let store = Store::open(root.clone(), "s", config.clone()).await?;
            store.write(vec![Op::put("a", "old")]).await?;
        }

        // Crashed between retiring the live generation and installing the
        // new one.
        root.rename("s", "s~retired").await?;
        root.cd("s~compact").mkdir().await?;
        root.cd("s~compact").write("catalog.json", b"partial").await?;

        let store = Store::open(root.clone(), "s", config.clone()).await?;
        assert_eq!(vec!["s".to_owned()], root.ls().await?);
        assert_eq!(
            Some(&Value::from("old")),
            store.read().await?.get("a")
        );

        // Crashed after installing and marking the retired copy, before
        // removing it.
        root.cd("s~retired").mkdir().await?;
        root.cd("s~retired").write("catalog.json", b"stale").await?;
        root.cd("s~retired").write(SUPERSEDED_MARKER, b"").await?;
        let store = Store::open(root.clone(), "s", config.clone()).await?;
        assert_eq!(vec!["s".to_owned()], root.ls().await?);
        assert_eq!(1, store.read().await?.len());

        // An unmarked retired copy was never replaced, so it wins over
        // whatever sits at the live name.
        root.rename("s", "s~retired").await?;
        root.cd("s").mkdir().await?;
        root.cd("s").write("catalog.json", b"newer").await?;
        let store = Store::open(root.clone(), "s", config).await?;
        assert_eq!(vec!["s".to_owned()], root.ls().await?);
        assert_eq!(
            Some(&Value::from("old")),
            store.read().await?.get("a")
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_restore_keeps_old_generation() -> anyhow::Result<()> {
        for config in layouts() {
            let root = MockDir::new();
            let config = config
                .auto_compact(false)
                .retry(RetryPolicy::new(2, Duration::from_millis(1)));
            let store = Store::open(root.clone(), "s", config.clone()).await?;
            churn(&store).await?;
            let before = store.read().await?;

            root.fs().fail_renames_from("s~compact", 2);
            root.fs().fail_renames_from("s~retired", 2);
            assert!(store.compact().await.is_err());
            assert_eq!(
                vec!["s~compact".to_owned(), "s~retired".to_owned()],
                root.ls().await?
            );

            // The next call puts the old generation back before using it.
            assert_eq!(before, store.read().await?);
            assert_eq!(vec!["s".to_owned()], root.ls().await?);

            store.write(vec![Op::put("new", "v")]).await?;
            let reopened = Store::open(root.clone(), "s", config).await?;
            let after = reopened.read().await?;
            assert_eq!(before.len() + 1, after.len());
            assert!(before.iter().all(|(k, v)| after.get(k) == Some(v)));
            assert_eq!(Some(&Value::from("v")), after.get("new"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_only_batches_trigger_compaction() -> anyhow::Result<()> {
        let root = MockDir::new();
        let store = Store::open(root.clone(), "s", StoreConfig::new(Layout::Chunk)).await?;
        store.write(vec![Op::put("key", "value")]).await?;
        for _ in 0..3 {
            store.write(vec![Op::delete("gone")]).await?;
        }
        assert_eq!(1, root.cd("s").ls().await?.len());
        assert_eq!(Some(&Value::from("value")), store.read().await?.get("key"));
        Ok(())
    }

    #[tokio::test]
    async fn compaction_on_disk() -> anyhow::Result<()> {
        for config in layouts() {
            let tmp = tempfile::tempdir()?;
            let root = OsDir::new(tmp.path());
            let store = Store::open(root.clone(), "s", config.auto_compact(false)).await?;
            churn(&store).await?;
            let before = store.read().await?;
            let size_before = crate::prune::dir_size(&root.cd("s")).await?;

            store.compact().await?;
            assert_eq!(before, store.read().await?);
            assert!(crate::prune::dir_size(&root.cd("s")).await? < size_before);
            assert_eq!(vec!["s".to_owned()], root.ls().await?);
        }
        Ok(())
    }
}
