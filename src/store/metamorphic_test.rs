use std::collections::BTreeMap;

use rand::Rng;

use crate::{
    config::{Layout, StoreConfig},
    fs::MockDir,
    value,
};

use super::Store;

#[derive(Debug, Clone)]
enum Op {
    Put(String, String),
    Delete(String),
    Get(String),
    Compact,
    Reopen,
    Close,
}

/// Logical ops, plus physical ops pinned to run just before the logical op
/// at their index. Physical ops must never change what the logical ops
/// observe.
#[derive(Debug, Clone)]
struct Schedule {
    logical: Vec<Op>,
    physical: Vec<(usize, Op)>,
}

impl Schedule {
    fn ops(&self) -> Vec<Op> {
        let mut physical = self.physical.iter().peekable();
        let mut out = Vec::new();
        for (i, op) in self.logical.iter().enumerate() {
            while let Some((_, p)) = physical.next_if(|(at, _)| *at <= i) {
                out.push(p.clone());
            }
            out.push(op.clone());
        }
        out.extend(physical.map(|(_, p)| p.clone()));
        out
    }

    fn without_logical(&self, idx: usize) -> Schedule {
        let mut logical = self.logical.clone();
        logical.remove(idx);
        let physical = self
            .physical
            .iter()
            .map(|(at, op)| (if *at > idx { at - 1 } else { *at }, op.clone()))
            .collect();
        Schedule { logical, physical }
    }

    fn without_physical(&self, idx: usize) -> Schedule {
        let mut physical = self.physical.clone();
        physical.remove(idx);
        Schedule {
            logical: self.logical.clone(),
            physical,
        }
    }
}

/// Greedily drops ops from a failing pair of schedules for as long as the
/// outputs still disagree.
fn shrink(layout: Layout, mut plain: Schedule, mut mixed: Schedule) -> (Schedule, Schedule) {
    loop {
        let candidates = (0..plain.logical.len())
            .map(|i| (plain.without_logical(i), mixed.without_logical(i)))
            .chain((0..mixed.physical.len()).map(|i| (plain.clone(), mixed.without_physical(i))));
        let smaller = candidates.into_iter().find(|(a, b)| {
            run_sequence(layout, a.ops()) != run_sequence(layout, b.ops())
        });
        match smaller {
            Some((a, b)) => {
                plain = a;
                mixed = b;
            }
            None => return (plain, mixed),
        }
    }
}

fn config(layout: Layout) -> StoreConfig {
    // Tiny segments and chunks so values straddle boundaries and batches
    // spread over many files.
    StoreConfig::new(layout)
        .log_size(16)
        .max_chunk_size(24)
        .large_value_threshold(8)
        .auto_compact(false)
}

async fn run_async(layout: Layout, inputs: Vec<Op>) -> Vec<Option<String>> {
    let dir = MockDir::new();
    let config = config(layout);
    let mut store = Store::open(dir.clone(), "s", config.clone()).await.unwrap();

    let mut out = Vec::new();
    // Puts and deletes are buffered into one batch until something else
    // happens, so batches mix overwrites of the same key.
    let mut batch = Vec::new();
    // Last write per key, which every read must agree with.
    let mut model = BTreeMap::new();

    for input in inputs {
        match input {
            Op::Put(k, v) => {
                model.insert(k.clone(), v.clone());
                batch.push(value::Op::put(k, v));
                continue;
            }
            Op::Delete(k) => {
                model.remove(&k);
                batch.push(value::Op::delete(k));
                continue;
            }
            _ => {}
        }
        store.write(std::mem::take(&mut batch)).await.unwrap();

        match input {
            Op::Get(k) => {
                let map = store.read().await.unwrap();
                let got = map
                    .get(&k)
                    .map(|v| String::from_utf8_lossy(v.as_bytes().unwrap()).into_owned());
                assert_eq!(model.get(&k), got.as_ref(), "read of {} disagrees", k);
                assert_eq!(model.len(), map.len());
                out.push(got);
            }
            Op::Compact => store.compact().await.unwrap(),
            Op::Reopen => {
                store = Store::open(dir.clone(), "s", config.clone()).await.unwrap();
            }
            Op::Close => store.close().await.unwrap(),
            Op::Put(..) | Op::Delete(..) => unreachable!(),
        }
    }

    out
}

fn run_sequence(layout: Layout, inputs: Vec<Op>) -> Vec<Option<String>> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(run_async(layout, inputs))
}

fn metamorphic_test(layout: Layout) {
    let mut rng = rand::thread_rng();
    let logical: Vec<Op> = (0..50)
        .map(|_| {
            let key = format!("key{}", rng.gen_range(0..10));
            match rng.gen_range(0..4) {
                0 | 1 => {
                    // Lengths vary so both value streams and straddling get used.
                    let len = rng.gen_range(0..20);
                    Op::Put(key, "v".repeat(len) + &rng.gen_range(0..10).to_string())
                }
                2 => Op::Delete(key),
                _ => Op::Get(key),
            }
        })
        .collect();

    let mut physical: Vec<(usize, Op)> = (0..30)
        .map(|_| {
            let at = rng.gen_range(0..logical.len());
            let op = match rng.gen_range(0..3) {
                0 => Op::Compact,
                1 => Op::Reopen,
                _ => Op::Close,
            };
            (at, op)
        })
        .collect();
    physical.sort_by_key(|(at, _)| *at);

    let plain = Schedule {
        logical: logical.clone(),
        physical: Vec::new(),
    };
    let mixed = Schedule { logical, physical };

    if run_sequence(layout, plain.ops()) != run_sequence(layout, mixed.ops()) {
        let (plain, mixed) = shrink(layout, plain, mixed);
        panic!(
            "physical ops changed the results\nwithout: {:#?}\nwith: {:#?}",
            plain.ops(),
            mixed.ops()
        );
    }
}

#[test]
fn metamorphic_catalog() {
    metamorphic_test(Layout::Catalog);
}

#[test]
fn metamorphic_chunk() {
    metamorphic_test(Layout::Chunk);
}
