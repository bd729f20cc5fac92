use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use futures::stream::{self, BoxStream, StreamExt};
use recon_core::Object;
use tokio::sync::mpsc;

/// One item from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Object),
    Deleted(Object),
    /// The transport reconnected and re-listed; this is the full collection.
    Restarted(Vec<Object>),
}

/// Source of truth for the object cache. Reconnecting after transport errors
/// is the feed's job; the informer only re-lists when a stream ends.
#[async_trait::async_trait]
pub trait Feed: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Object>>;
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>>;
}

/// In-memory feed: a fixed listing plus watch events pushed through a channel.
pub struct ChannelFeed {
    listing: Mutex<Vec<Object>>,
    rx: Mutex<Option<mpsc::Receiver<WatchEvent>>>,
    failing_lists: AtomicUsize,
}

impl ChannelFeed {
    pub fn new(listing: Vec<Object>) -> (mpsc::Sender<WatchEvent>, Self) {
        let (tx, rx) = mpsc::channel(1024);
        let feed = Self { listing: Mutex::new(listing), rx: Mutex::new(Some(rx)), failing_lists: AtomicUsize::new(0) };
        (tx, feed)
    }

    /// Listing returned by subsequent `list_all` calls.
    pub fn set_listing(&self, listing: Vec<Object>) {
        *self.listing.lock().unwrap_or_else(PoisonError::into_inner) = listing;
    }

    /// Make the next `n` listings fail.
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Feed for ChannelFeed {
    async fn list_all(&self) -> Result<Vec<Object>> {
        let failing = self.failing_lists.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(anyhow!("listing unavailable"));
        }
        Ok(self.listing.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// The channel can be watched once; later watches stay silent.
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>> {
        match self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok(ev), rx)) }).boxed(),
            None => stream::pending().boxed(),
        }
    }
}
