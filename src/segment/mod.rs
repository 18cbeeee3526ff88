//! Fixed-size append segments for the catalog layout.
//!
//! The catalog addresses one contiguous byte range; segment `n` holds bytes
//! `[n * log_size, (n + 1) * log_size)`. A value may straddle any number of
//! segment boundaries.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{error::StoreError, fs::StoreDir, pool::BufferPool, retry::RetryPolicy};

/// How long to wait after unlinking a stale segment before reopening its
/// name. Some filesystems report the old file for a moment afterwards.
const SETTLE_DELAY: Duration = Duration::from_millis(10);

pub fn segment_name(index: u64) -> String {
    format!("log{:04}", index)
}

pub fn segment_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("log")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Closed,
    Opening,
    Append,
    Read,
}

/// Appends values at the catalog's write cursor.
///
/// The appender keeps one segment-sized buffer. `fill` is how far it has
/// been written, `flushed` how much of that already reached the file.
#[derive(Debug)]
pub struct Appender<D> {
    dir: D,
    log_size: u64,
    retry: RetryPolicy,
    state: SegmentState,
    index: u64,
    buf: Vec<u8>,
    fill: usize,
    flushed: usize,
}

impl<D> Appender<D>
where
    D: StoreDir,
{
    pub fn new(dir: D, log_size: u64, retry: RetryPolicy, cursor: u64) -> Self {
        Appender {
            dir,
            log_size,
            retry,
            state: SegmentState::Closed,
            index: cursor / log_size,
            buf: Vec::new(),
            fill: (cursor % log_size) as usize,
            flushed: (cursor % log_size) as usize,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Absolute offset the next appended byte lands at.
    pub fn cursor(&self) -> u64 {
        self.index * self.log_size + self.fill as u64
    }

    async fn open(&mut self, pool: &mut BufferPool) -> anyhow::Result<()> {
        self.state = SegmentState::Opening;
        match self.prepare().await {
            Ok(()) => {
                let mut buf = pool.checkout(self.log_size as usize);
                buf.resize(self.log_size as usize, 0);
                self.buf = buf;
                self.state = SegmentState::Append;
                Ok(())
            }
            Err(e) => {
                self.state = SegmentState::Closed;
                Err(e)
            }
        }
    }

    /// Makes the file under the cursor agree with it: at a boundary nothing
    /// may be there yet, mid-segment exactly `fill` bytes must be.
    async fn prepare(&self) -> anyhow::Result<()> {
        let name = segment_name(self.index);
        let existing = self.dir.stat(&name).await?.map_or(0, |s| s.len);

        if self.fill == 0 {
            if existing > 0 {
                warn!(segment = %name, bytes = existing, "removing stale segment");
                let dir = &self.dir;
                let name = name.as_str();
                self.retry
                    .run("unlinking stale segment", move || dir.unlink(name))
                    .await?;
                tokio::time::sleep(SETTLE_DELAY).await;
            }
            return Ok(());
        }

        let expected = self.fill as u64;
        if existing < expected {
            return Err(StoreError::format(format!(
                "segment {} holds {} bytes, expected at least {}",
                name, existing, expected
            ))
            .into());
        }
        if existing > expected {
            warn!(
                segment = %name,
                bytes = existing - expected,
                "truncating bytes left by an aborted write"
            );
            self.dir.truncate(&name, expected).await?;
        }
        Ok(())
    }

    /// Buffers `data` at the cursor, splitting it across as many segments as
    /// it needs. Full segments are flushed and closed as they fill up.
    pub async fn append(&mut self, pool: &mut BufferPool, data: &[u8]) -> anyhow::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.state != SegmentState::Append {
                self.open(pool).await?;
            }
            let n = rest.len().min(self.buf.len() - self.fill);
            self.copy_in(&rest[..n])?;
            rest = &rest[n..];
            if self.fill == self.buf.len() {
                self.rotate(pool).await?;
            }
        }
        Ok(())
    }

    fn copy_in(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let end = self.fill + data.len();
        if end > self.buf.len() {
            return Err(StoreError::Capacity {
                offset: self.fill as u64,
                len: data.len() as u64,
                capacity: self.buf.len() as u64,
            }
            .into());
        }
        self.buf[self.fill..end].copy_from_slice(data);
        self.fill = end;
        Ok(())
    }

    /// Writes the unflushed tail of the buffer with a single append.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        if self.state != SegmentState::Append || self.flushed == self.fill {
            return Ok(());
        }
        let name = segment_name(self.index);
        let (dir, name) = (&self.dir, name.as_str());
        let (flushed, tail) = (self.flushed as u64, &self.buf[self.flushed..self.fill]);
        let mut retrying = false;
        self.retry
            .run("segment append", move || {
                let truncate_first = std::mem::replace(&mut retrying, true);
                async move {
                    // A failed append may have landed part of the tail.
                    if truncate_first && dir.stat(name).await?.map_or(0, |s| s.len) > flushed {
                        dir.truncate(name, flushed).await?;
                    }
                    dir.append(name, tail).await
                }
            })
            .await?;
        self.flushed = self.fill;
        Ok(())
    }

    async fn rotate(&mut self, pool: &mut BufferPool) -> anyhow::Result<()> {
        self.close(pool).await?;
        debug!(segment = %segment_name(self.index), "segment full");
        self.index += 1;
        self.fill = 0;
        self.flushed = 0;
        Ok(())
    }

    pub async fn close(&mut self, pool: &mut BufferPool) -> anyhow::Result<()> {
        self.flush().await?;
        if self.state == SegmentState::Append {
            pool.give_back(std::mem::take(&mut self.buf));
        }
        self.state = SegmentState::Closed;
        Ok(())
    }
}

/// Streams value ranges out of the segments, in increasing offset order.
#[derive(Debug)]
pub struct SegmentReader<D> {
    dir: D,
    log_size: u64,
    state: SegmentState,
    index: u64,
    current: Vec<u8>,
}

impl<D> SegmentReader<D>
where
    D: StoreDir,
{
    pub fn new(dir: D, log_size: u64) -> Self {
        SegmentReader {
            dir,
            log_size,
            state: SegmentState::Closed,
            index: 0,
            current: Vec::new(),
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    async fn load(&mut self, pool: &mut BufferPool, index: u64) -> anyhow::Result<()> {
        if self.state == SegmentState::Read && self.index == index {
            return Ok(());
        }
        let name = segment_name(index);
        let data = self
            .dir
            .read(&name)
            .await?
            .ok_or_else(|| StoreError::format(format!("segment {} is missing", name)))?;
        pool.give_back(std::mem::replace(&mut self.current, data));
        self.index = index;
        self.state = SegmentState::Read;
        Ok(())
    }

    /// Appends `[start, start + size)` of the address space to `dest`.
    pub async fn read_into(
        &mut self,
        pool: &mut BufferPool,
        start: u64,
        size: u64,
        dest: &mut Vec<u8>,
    ) -> anyhow::Result<()> {
        let end = start + size;
        let mut pos = start;
        while pos < end {
            let index = pos / self.log_size;
            let base = index * self.log_size;
            self.load(pool, index).await?;

            let from = (pos - base) as usize;
            let to = (end - base).min(self.log_size) as usize;
            if self.current.len() < to {
                return Err(StoreError::format(format!(
                    "segment {} holds {} bytes, expected at least {}",
                    segment_name(index),
                    self.current.len(),
                    to
                ))
                .into());
            }
            dest.extend_from_slice(&self.current[from..to]);
            pos = base + to as u64;
        }
        Ok(())
    }

    pub fn finish(mut self, pool: &mut BufferPool) {
        pool.give_back(std::mem::take(&mut self.current));
        self.state = SegmentState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Event, MockDir};

    fn setup() -> (MockDir, BufferPool) {
        (MockDir::new(), BufferPool::new(4))
    }

    #[test]
    fn names() {
        assert_eq!("log0000", segment_name(0));
        assert_eq!("log0042", segment_name(42));
        assert_eq!("log12345", segment_name(12345));
        assert_eq!(Some(42), segment_index("log0042"));
        assert_eq!(None, segment_index("log"));
        assert_eq!(None, segment_index("log00a1"));
        assert_eq!(None, segment_index("catalog.json"));
    }

    #[tokio::test]
    async fn values_straddle_segments() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        let mut appender = Appender::new(dir.clone(), 8, RetryPolicy::default(), 0);

        appender.append(&mut pool, b"abc").await?;
        assert_eq!(SegmentState::Append, appender.state());
        appender.append(&mut pool, b"defghijklmnopqrst").await?;
        assert_eq!(20, appender.cursor());
        appender.flush().await?;

        assert_eq!(Some(b"abcdefgh".to_vec()), dir.read("log0000").await?);
        assert_eq!(Some(b"ijklmnop".to_vec()), dir.read("log0001").await?);
        assert_eq!(Some(b"qrst".to_vec()), dir.read("log0002").await?);

        let mut reader = SegmentReader::new(dir.clone(), 8);
        let mut out = Vec::new();
        reader.read_into(&mut pool, 3, 17, &mut out).await?;
        assert_eq!(b"defghijklmnopqrst".as_slice(), &out[..]);
        assert_eq!(SegmentState::Read, reader.state());
        reader.finish(&mut pool);
        Ok(())
    }

    #[tokio::test]
    async fn flush_writes_only_the_tail() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        let mut appender = Appender::new(dir.clone(), 16, RetryPolicy::default(), 0);
        appender.append(&mut pool, b"abc").await?;
        appender.flush().await?;
        appender.flush().await?;
        appender.append(&mut pool, b"de").await?;
        appender.close(&mut pool).await?;
        assert_eq!(SegmentState::Closed, appender.state());

        let appends: Vec<_> = dir
            .fs()
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, Event::Append(..)))
            .collect();
        assert_eq!(
            vec![
                Event::Append("log0000".into(), 3),
                Event::Append("log0000".into(), 2),
            ],
            appends
        );
        Ok(())
    }

    #[tokio::test]
    async fn torn_appends_are_retried() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        let mut appender = Appender::new(dir.clone(), 16, retry, 0);
        appender.append(&mut pool, b"abc").await?;
        appender.flush().await?;

        dir.fs().fail_writes_to("log0000", 2);
        appender.append(&mut pool, b"defg").await?;
        appender.flush().await?;
        assert_eq!(Some(b"abcdefg".to_vec()), dir.read("log0000").await?);
        Ok(())
    }

    #[tokio::test]
    async fn reopen_mid_segment_truncates_aborted_bytes() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        dir.write("log0000", b"abcXYZ").await?;

        let mut appender = Appender::new(dir.clone(), 8, RetryPolicy::default(), 3);
        appender.append(&mut pool, b"de").await?;
        appender.flush().await?;
        assert_eq!(Some(b"abcde".to_vec()), dir.read("log0000").await?);
        Ok(())
    }

    #[tokio::test]
    async fn reopen_on_short_segment_is_a_format_error() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        dir.write("log0000", b"ab").await?;

        let mut appender = Appender::new(dir.clone(), 8, RetryPolicy::default(), 5);
        let err = appender.append(&mut pool, b"x").await.unwrap_err();
        assert!(crate::error::is_format_error(&err));
        assert_eq!(SegmentState::Closed, appender.state());
        Ok(())
    }

    #[tokio::test]
    async fn stale_segment_at_boundary_is_replaced() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        dir.write("log0001", b"leftover").await?;

        let mut appender = Appender::new(dir.clone(), 4, RetryPolicy::default(), 4);
        appender.append(&mut pool, b"new").await?;
        appender.flush().await?;
        assert_eq!(Some(b"new".to_vec()), dir.read("log0001").await?);
        assert!(dir
            .fs()
            .iter_events()
            .any(|e| *e == Event::Unlink("log0001".into())));
        Ok(())
    }

    #[tokio::test]
    async fn short_segment_on_read_is_a_format_error() -> anyhow::Result<()> {
        let (dir, mut pool) = setup();
        dir.write("log0000", b"abcd").await?;
        let mut reader = SegmentReader::new(dir.clone(), 8);
        let mut out = Vec::new();
        let err = reader
            .read_into(&mut pool, 2, 4, &mut out)
            .await
            .unwrap_err();
        assert!(crate::error::is_format_error(&err));
        Ok(())
    }
}
