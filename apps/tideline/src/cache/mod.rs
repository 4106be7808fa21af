//! Content-addressed cache for server messages.
//!
//! The server marks large messages as cacheable. The first delivery carries
//! the full payload, which is kept here under its hash; later deliveries may
//! be sent as reference messages naming only that hash. A reference that
//! misses the cache (evicted, or never seen on this connection) is fetched
//! from the message endpoint.
//!
//! Entries age by script run: [`MessageCache::increment_run_count`] is called
//! once per completed run and evicts every entry not touched within
//! `max_age` runs.
//!
//! ```
//! # use std::sync::Arc;
//! # use bytes::Bytes;
//! # use tideline_client_core::cache::{MessageCache, Lookup, NoFetch};
//! # use tideline_client_core::protocol::{encode_forward_msg, ForwardMsg, ForwardMsgBody, ForwardMsgMetadata, PageInfo};
//! let cache = MessageCache::new(Arc::new(NoFetch));
//! let msg = ForwardMsg::new("h1", ForwardMsgBody::PageInfoChanged(PageInfo::default()))
//!     .with_metadata(ForwardMsgMetadata { cacheable: true, delta_path: vec![] });
//! let raw = encode_forward_msg(&msg).unwrap();
//! assert!(matches!(cache.resolve_local(msg, &raw).unwrap(), Lookup::Ready(_)));
//! assert!(cache.contains("h1"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::config::message_url;
use crate::protocol::{ForwardMsg, ForwardMsgMetadata, ProtocolError, decode_forward_msg};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid message endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("network error fetching {hash}: {source}")]
    Network {
        hash: String,
        source: reqwest::Error,
    },
    #[error("unexpected http status {status} fetching {hash}")]
    HttpStatus { hash: String, status: StatusCode },
    #[error("cached message {hash} is undecodable: {source}")]
    Decode {
        hash: String,
        source: ProtocolError,
    },
    #[error("message {0} is not cached and cannot be fetched")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub last_access_run_count: u64,
}

/// Side channel used to fetch payloads the cache does not hold.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, base: &Url, hash: &str) -> Result<Bytes, CacheError>;
}

#[derive(Clone, Default)]
pub struct ReqwestPayloadFetcher {
    client: reqwest::Client,
}

impl ReqwestPayloadFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PayloadFetcher for ReqwestPayloadFetcher {
    async fn fetch(&self, base: &Url, hash: &str) -> Result<Bytes, CacheError> {
        let endpoint = message_url(base, hash)?;
        let network = |source| CacheError::Network {
            hash: hash.to_string(),
            source,
        };
        let response = self.client.get(endpoint).send().await.map_err(network)?;
        if !response.status().is_success() {
            return Err(CacheError::HttpStatus {
                hash: hash.to_string(),
                status: response.status(),
            });
        }
        response.bytes().await.map_err(network)
    }
}

/// Fetcher for caches that must only ever be served locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFetch;

#[async_trait]
impl PayloadFetcher for NoFetch {
    async fn fetch(&self, _base: &Url, hash: &str) -> Result<Bytes, CacheError> {
        Err(CacheError::Unavailable(hash.to_string()))
    }
}

/// Outcome of resolving a message against local state only.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Ready(ForwardMsg),
    /// A reference to a payload the cache does not hold.
    Fetch {
        hash: String,
        metadata: ForwardMsgMetadata,
    },
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    run_count: u64,
}

pub struct MessageCache {
    inner: Mutex<Inner>,
    fetcher: Arc<dyn PayloadFetcher>,
}

impl MessageCache {
    pub fn new(fetcher: Arc<dyn PayloadFetcher>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fetcher,
        }
    }

    /// Runs a message through the cache, fetching a missed reference from
    /// the server at `base`.
    pub async fn process_message_payload(
        &self,
        base: &Url,
        msg: ForwardMsg,
        raw: &Bytes,
    ) -> Result<ForwardMsg, CacheError> {
        match self.resolve_local(msg, raw)? {
            Lookup::Ready(msg) => Ok(msg),
            Lookup::Fetch { hash, metadata } => self.fetch_missing(base, &hash, metadata).await,
        }
    }

    /// Stores cacheable messages and serves reference hits without awaiting.
    pub fn resolve_local(&self, msg: ForwardMsg, raw: &Bytes) -> Result<Lookup, CacheError> {
        let Some(hash) = msg.ref_hash().map(str::to_string) else {
            if msg.metadata.cacheable {
                self.store(&msg.hash, raw.clone());
            }
            return Ok(Lookup::Ready(msg));
        };

        let payload = {
            let mut inner = self.inner.lock();
            let run_count = inner.run_count;
            inner.entries.get_mut(&hash).map(|entry| {
                entry.last_access_run_count = run_count;
                entry.payload.clone()
            })
        };

        match payload {
            Some(payload) => {
                trace!(target = "tideline::cache", hash = %hash, "reference hit");
                let resolved = decode_payload(&hash, &payload)?;
                Ok(Lookup::Ready(resolved.with_metadata(msg.metadata)))
            }
            None => {
                debug!(target = "tideline::cache", hash = %hash, "reference miss");
                Ok(Lookup::Fetch {
                    hash,
                    metadata: msg.metadata,
                })
            }
        }
    }

    /// Fetches a missed payload, caches it under `hash` and returns it
    /// carrying the referencing message's metadata.
    pub async fn fetch_missing(
        &self,
        base: &Url,
        hash: &str,
        metadata: ForwardMsgMetadata,
    ) -> Result<ForwardMsg, CacheError> {
        let payload = self.fetcher.fetch(base, hash).await?;
        let resolved = decode_payload(hash, &payload)?;
        self.store(hash, payload);
        debug!(target = "tideline::cache", hash = %hash, kind = resolved.body.label(), "fetched missing message");
        Ok(resolved.with_metadata(metadata))
    }

    /// Advances the run counter and evicts entries older than `max_age` runs.
    pub fn increment_run_count(&self, max_age: u64) {
        let mut inner = self.inner.lock();
        inner.run_count += 1;
        let run_count = inner.run_count;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| run_count - entry.last_access_run_count <= max_age);
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            debug!(
                target = "tideline::cache",
                run_count,
                evicted,
                remaining = inner.entries.len(),
                "evicted stale messages"
            );
        }
    }

    pub fn run_count(&self) -> u64 {
        self.inner.lock().run_count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    pub fn last_access(&self, hash: &str) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .get(hash)
            .map(|entry| entry.last_access_run_count)
    }

    fn store(&self, hash: &str, payload: Bytes) {
        let mut inner = self.inner.lock();
        let last_access_run_count = inner.run_count;
        inner.entries.insert(
            hash.to_string(),
            CacheEntry {
                payload,
                last_access_run_count,
            },
        );
    }
}

fn decode_payload(hash: &str, payload: &[u8]) -> Result<ForwardMsg, CacheError> {
    decode_forward_msg(payload).map_err(|source| CacheError::Decode {
        hash: hash.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ForwardMsgBody, PageInfo, encode_forward_msg};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockFetcher {
        payloads: Mutex<HashMap<String, Bytes>>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn serve(&self, hash: &str, payload: Bytes) {
            self.payloads.lock().insert(hash.to_string(), payload);
        }
    }

    #[async_trait]
    impl PayloadFetcher for MockFetcher {
        async fn fetch(&self, _base: &Url, hash: &str) -> Result<Bytes, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .lock()
                .get(hash)
                .cloned()
                .ok_or_else(|| CacheError::Unavailable(hash.to_string()))
        }
    }

    fn base() -> Url {
        Url::parse("http://127.0.0.1:8501/").unwrap()
    }

    fn page(hash: &str, query: &str, cacheable: bool) -> (ForwardMsg, Bytes) {
        let msg = ForwardMsg::new(
            hash,
            ForwardMsgBody::PageInfoChanged(PageInfo {
                query_string: query.to_string(),
            }),
        )
        .with_metadata(ForwardMsgMetadata {
            cacheable,
            delta_path: vec![0, 1],
        });
        let raw = encode_forward_msg(&msg).unwrap();
        (msg, raw)
    }

    fn reference(hash: &str, delta_path: Vec<usize>) -> (ForwardMsg, Bytes) {
        let msg = ForwardMsg::new(format!("ref-{hash}"), ForwardMsgBody::RefHash(hash.into()))
            .with_metadata(ForwardMsgMetadata {
                cacheable: false,
                delta_path,
            });
        let raw = encode_forward_msg(&msg).unwrap();
        (msg, raw)
    }

    #[tokio::test]
    async fn storing_twice_is_idempotent_and_refreshes_age() {
        let cache = MessageCache::new(Arc::new(NoFetch));
        let (msg, raw) = page("h1", "a=1", true);

        let first = cache
            .process_message_payload(&base(), msg.clone(), &raw)
            .await
            .unwrap();
        assert_eq!(first, msg);

        cache.increment_run_count(5);
        let second = cache
            .process_message_payload(&base(), msg.clone(), &raw)
            .await
            .unwrap();
        assert_eq!(second, msg);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last_access("h1"), Some(1));
    }

    #[test]
    fn uncacheable_messages_are_not_stored() {
        let cache = MessageCache::new(Arc::new(NoFetch));
        let (msg, raw) = page("h1", "", false);
        assert_eq!(cache.resolve_local(msg.clone(), &raw).unwrap(), Lookup::Ready(msg));
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_keeps_entries_at_max_age() {
        let cache = MessageCache::new(Arc::new(NoFetch));
        let (msg, raw) = page("h1", "", true);
        cache.resolve_local(msg, &raw).unwrap();

        cache.increment_run_count(2);
        cache.increment_run_count(2);
        assert!(cache.contains("h1"), "age == max_age stays");

        cache.increment_run_count(2);
        assert!(!cache.contains("h1"), "age == max_age + 1 is evicted");
        assert_eq!(cache.run_count(), 3);
    }

    #[test]
    fn reference_hit_refreshes_age_and_keeps_delivery_metadata() {
        let cache = MessageCache::new(Arc::new(NoFetch));
        let (msg, raw) = page("h1", "a=1", true);
        cache.resolve_local(msg.clone(), &raw).unwrap();
        cache.increment_run_count(2);
        cache.increment_run_count(2);

        let (reference, raw_ref) = reference("h1", vec![1, 4]);
        let Lookup::Ready(resolved) = cache.resolve_local(reference, &raw_ref).unwrap() else {
            panic!("expected a cache hit");
        };
        assert_eq!(resolved.body, msg.body);
        assert_eq!(resolved.hash, "h1");
        assert_eq!(resolved.metadata.delta_path, vec![1, 4]);
        assert_eq!(cache.last_access("h1"), Some(2));

        // refreshed at run 2, so one more run keeps it
        cache.increment_run_count(2);
        assert!(cache.contains("h1"));
    }

    #[tokio::test]
    async fn reference_miss_fetches_and_caches() {
        let fetcher = Arc::new(MockFetcher::default());
        let (msg, raw) = page("h9", "b=2", true);
        fetcher.serve("h9", raw);
        let cache = MessageCache::new(fetcher.clone());

        let (reference, raw_ref) = reference("h9", vec![0, 3]);
        let resolved = cache
            .process_message_payload(&base(), reference.clone(), &raw_ref)
            .await
            .unwrap();
        assert_eq!(resolved.body, msg.body);
        assert_eq!(resolved.metadata.delta_path, vec![0, 3]);
        assert!(cache.contains("h9"));

        cache
            .process_message_payload(&base(), reference, &raw_ref)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_fetched_payload_is_an_error() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.serve("bad", Bytes::from_static(b"not a message"));
        let cache = MessageCache::new(fetcher);

        let (reference, raw_ref) = reference("bad", vec![]);
        let err = cache
            .process_message_payload(&base(), reference, &raw_ref)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Decode { ref hash, .. } if hash == "bad"));
        assert!(!cache.contains("bad"));
    }

    #[tokio::test]
    async fn unavailable_payload_is_an_error() {
        let cache = MessageCache::new(Arc::new(NoFetch));
        let (reference, raw_ref) = reference("gone", vec![]);
        let err = cache
            .process_message_payload(&base(), reference, &raw_ref)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
    }
}
