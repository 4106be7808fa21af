use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resolver dropped without a value")]
pub struct Abandoned;

/// Write side of a single-shot value. Clones share the slot; the first
/// `resolve` wins and later calls are ignored.
#[derive(Debug)]
pub struct Resolver<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Resolver<T> {
    pub fn new() -> (Self, Deferred<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            Deferred { rx },
        )
    }

    /// Returns false if the value was already resolved or nobody is waiting.
    pub fn resolve(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Read side of a [`Resolver`]. Fails with [`Abandoned`] once every resolver
/// clone is dropped unresolved.
#[derive(Debug)]
pub struct Deferred<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolve_wins() {
        let (resolver, deferred) = Resolver::new();
        let other = resolver.clone();
        assert!(resolver.resolve(1));
        assert!(!other.resolve(2));
        assert!(other.is_resolved());
        assert_eq!(deferred.await, Ok(1));
    }

    #[tokio::test]
    async fn resolves_across_tasks() {
        let (resolver, deferred) = Resolver::new();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            resolver.resolve("ready");
        });
        assert_eq!(deferred.await, Ok("ready"));
    }

    #[tokio::test]
    async fn dropping_every_resolver_abandons() {
        let (resolver, deferred) = Resolver::<u8>::new();
        drop(resolver);
        assert_eq!(deferred.await, Err(Abandoned));
    }
}
