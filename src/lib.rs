//! An embedded, append-only key/value store for build-cache artifacts.
//!
//! A long-lived build process calls [`Store::read`] once at startup to get
//! everything cached by earlier runs, [`Store::write`] at the end of a unit of
//! work, and [`Store::compact`] (or lets writes trigger it) to drop
//! superseded bytes.
//!
//! Two on-disk layouts sit behind the same API, chosen with
//! [`StoreConfig::layout`]:
//!
//! * [`Layout::Catalog`]: one `catalog.json` index plus fixed-size segment
//!   files addressed as a single byte range.
//! * [`Layout::Chunk`]: self-describing chunk files, each with its own table;
//!   deletes are tombstones and the highest-numbered chunk wins.
//!
//! All I/O goes through [`StoreDir`]; [`OsDir`] is the real filesystem and
//! [`MockDir`] an in-memory one for tests.

mod config;
mod error;
mod fs;
mod retry;
mod store;
mod value;

pub mod catalog;
pub mod chunk;
pub mod pool;
pub mod prune;
pub mod segment;

pub use config::{Layout, ReadMode, StoreConfig};
pub use error::{is_format_error, StoreError};
pub use fs::{Event, MockDir, MockFs, OsDir, Stat, StoreDir};
pub use pool::BufferPool;
pub use retry::RetryPolicy;
pub use store::Store;
pub use value::{Op, Sizes, Value};
