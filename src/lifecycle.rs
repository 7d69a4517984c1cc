//! One process-wide engine behind `init`/`close`.
//!
//! The state is a tri-state guarded by a single mutex:
//!
//! ```text
//! Uninitialized --init--> Ready --close--> Closed
//!                          ^ |               |
//!                          +-+ init (replace)|
//!                          ^-----------------+ init (fresh engine)
//! ```
//!
//! Operations clone the [`Engine`] handle out of the lock before awaiting, so
//! the mutex is never held across a suspension point. A request racing a
//! `close` is refused by the engine itself with [`Error::NotInitialized`].

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{CacheBackend, EngineConfig};
use crate::engine::{BatchReport, Engine, FeedReport, ShutdownSummary};
use crate::error::Error;
use crate::search::SearchHit;

enum Lifecycle {
    Uninitialized,
    Ready(Engine),
    Closed,
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Ready,
    Closed,
}

static STATE: Mutex<Lifecycle> = Mutex::new(Lifecycle::Uninitialized);

fn lock() -> MutexGuard<'static, Lifecycle> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn engine() -> Result<Engine, Error> {
    match &*lock() {
        Lifecycle::Ready(engine) => Ok(engine.clone()),
        Lifecycle::Uninitialized | Lifecycle::Closed => Err(Error::NotInitialized),
    }
}

pub fn state() -> State {
    match &*lock() {
        Lifecycle::Uninitialized => State::Uninitialized,
        Lifecycle::Ready(_) => State::Ready,
        Lifecycle::Closed => State::Closed,
    }
}

/// Builds an engine from `config` and makes it the process-wide one.
///
/// If an engine is already running it is closed after the new one is in
/// place. If building fails the previous state is left untouched.
pub async fn init(config: EngineConfig) -> Result<(), Error> {
    let engine = Engine::new(config).await?;
    let previous = std::mem::replace(&mut *lock(), Lifecycle::Ready(engine));
    if let Lifecycle::Ready(old) = previous {
        tracing::info!("Replacing running feed engine");
        old.close().await;
    }
    Ok(())
}

/// [`init`] with defaults for everything except the cache backend.
pub async fn init_with_cache(
    backend: CacheBackend,
    cache_path: Option<PathBuf>,
) -> Result<(), Error> {
    init(EngineConfig::with_cache(backend, cache_path)).await
}

/// Shuts the process-wide engine down.
///
/// Returns `None` when there was nothing to close.
pub async fn close() -> Option<ShutdownSummary> {
    let engine = {
        let mut state = lock();
        match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Ready(engine) => engine,
            Lifecycle::Uninitialized => {
                *state = Lifecycle::Uninitialized;
                return None;
            }
            Lifecycle::Closed => return None,
        }
    };
    Some(engine.close().await)
}

pub async fn parse_feed(url: &str, enrich: bool) -> Result<FeedReport, Error> {
    engine()?.parse_feed(url, enrich).await
}

pub async fn parse_feed_without_enrichment(url: &str) -> Result<FeedReport, Error> {
    engine()?.parse_feed_without_enrichment(url).await
}

pub async fn parse_feeds<S: AsRef<str>>(urls: &[S]) -> Result<BatchReport, Error> {
    Ok(engine()?.parse_feeds(urls).await)
}

pub async fn search(query: &str) -> Result<Vec<SearchHit>, Error> {
    engine()?.search(query).await
}
