//! Conditions callers need to tell apart.
//!
//! Operations return `anyhow::Result`; the variants below travel inside the
//! `anyhow::Error` and can be recovered with `downcast_ref::<StoreError>()`.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stored data could not be decoded or was written by an incompatible
    /// format version. The store heals itself by starting over empty.
    #[error("corrupt or incompatible store data: {reason}")]
    Format { reason: String },

    /// A write would land past the end of its segment. This is a bug in the
    /// offset arithmetic and is never retried.
    #[error("write of {len} bytes at segment offset {offset} exceeds capacity {capacity}")]
    Capacity { offset: u64, len: u64, capacity: u64 },

    /// The segment appender and the catalog disagree about the write cursor.
    #[error("appender cursor {actual} does not match catalog cursor {expected}")]
    Cursor { expected: u64, actual: u64 },

    /// Another writer claimed the chunk file name first.
    #[error("lost the race to claim chunk file {name}")]
    ClaimRace { name: String },

    /// The compacted generation could not be moved into place. The previous
    /// generation is still intact.
    #[error("could not install compacted store {name}")]
    SwapFailed { name: String },

    #[error("{what} still failing after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },
}

impl StoreError {
    pub fn format(reason: impl Into<String>) -> Self {
        StoreError::Format {
            reason: reason.into(),
        }
    }

    /// Whether this error signals a logic defect rather than bad input or a
    /// flaky filesystem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Capacity { .. } | StoreError::Cursor { .. })
    }
}

/// Whether `err` carries a [`StoreError::Format`] anywhere in its chain.
pub fn is_format_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::Format { .. })
        )
    })
}
