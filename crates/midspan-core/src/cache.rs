//! Cache engine contract.
//!
//! Storage internals are a collaborator behind a trait; the state machine
//! only cares about lookup outcomes, the action they imply for this
//! transaction, and the write-lock dance. Storage errors mid-read convert
//! to an origin fetch when one is still possible; mid-write errors drop
//! the write and keep serving.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::config::CacheOpenWriteFailAction;

/// Cache key: today the effective request URL, post-remap.
pub type CacheKey = String;

/// What this transaction will do with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheAction {
    /// Cache not involved
    #[default]
    None,
    /// Serve the stored object
    Serve,
    /// Serve the stored object, then delete it
    ServeAndDelete,
    /// Serve the stored object and refresh its headers
    ServeAndUpdate,
    /// Update stored headers without serving
    Update,
    /// Write a new object
    Write,
    /// Replace the stored object
    Replace,
    /// Delete the stored object
    Delete,
}

/// State of the object write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteLockState {
    /// No write attempted
    #[default]
    Init,
    /// Lock acquired; the transaction may stream the object in
    Acquired,
    /// Another writer holds the lock
    Contended,
    /// Open-write failed for a non-lock reason
    Error,
}

/// A stored response usable by the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    /// Stored response status
    pub status: StatusCode,
    /// Stored response headers
    pub headers: HeaderMap,
    /// Stored body
    pub body: Bytes,
    /// When the origin request that produced this object was sent
    pub request_sent_time: i64,
    /// When the origin response was received
    pub response_received_time: i64,
}

/// Outcome of an open-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReadResult {
    /// Fresh enough to serve
    Hit(CachedObject),
    /// Present but needs revalidation at the origin
    HitStale(CachedObject),
    /// Nothing stored under the key
    Miss,
    /// Storage failed; treat as a miss when origin is reachable
    Error(String),
}

/// Outcome of an open-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWriteResult {
    /// Write lock acquired
    Ready,
    /// Another transaction is writing this object
    LockContended,
    /// Storage failed
    Error(String),
}

/// Cache engine collaborator.
pub trait CacheEngine {
    /// Look up `key` for reading.
    fn open_read(&self, key: &CacheKey) -> CacheReadResult;

    /// Acquire the write lock for `key`.
    fn open_write(&self, key: &CacheKey) -> CacheWriteResult;

    /// Commit a finished object under `key`. Errors are logged by the
    /// engine and otherwise ignored: the response was already served.
    fn commit(&self, key: &CacheKey, object: CachedObject);

    /// Release the write lock without committing.
    fn abort_write(&self, key: &CacheKey);

    /// Remove `key`.
    fn remove(&self, key: &CacheKey);
}

/// Decide how to proceed after an open-write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailPath {
    /// Fetch from origin without caching
    FetchUncached,
    /// Retry the cache read; the competing writer may finish first
    ReadRetry,
    /// Fail the transaction (502-class) instead of hammering the origin
    Error,
}

/// Map the configured fail action onto a path for this lookup outcome.
#[must_use]
pub fn on_write_fail(
    action: CacheOpenWriteFailAction,
    was_revalidation: bool,
) -> WriteFailPath {
    match action {
        CacheOpenWriteFailAction::Default => WriteFailPath::FetchUncached,
        CacheOpenWriteFailAction::ReadRetry => WriteFailPath::ReadRetry,
        CacheOpenWriteFailAction::ErrorOnMissOrRevalidate => {
            let _ = was_revalidation;
            WriteFailPath::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_fail_paths() {
        assert_eq!(
            on_write_fail(CacheOpenWriteFailAction::Default, false),
            WriteFailPath::FetchUncached
        );
        assert_eq!(
            on_write_fail(CacheOpenWriteFailAction::ReadRetry, false),
            WriteFailPath::ReadRetry
        );
        assert_eq!(
            on_write_fail(CacheOpenWriteFailAction::ErrorOnMissOrRevalidate, true),
            WriteFailPath::Error
        );
    }
}
