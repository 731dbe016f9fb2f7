//! Near cache
//!
//! Holders keep read copies of entries owned elsewhere; owners track who
//! holds what and push invalidations after every committed change.

pub mod cache;
pub mod readers;

pub use cache::{NearCache, StaleRead, Unsubscribe};
pub use readers::ReaderRegistry;

use crate::grid::protocol::PeerRequest;
use crate::grid::transport::Transport;
use crate::grid::NodeId;
use crate::store::Version;
use futures_util::future::join_all;

/// One invalidation to deliver to a holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub reader: NodeId,
    pub key: String,
    pub version: Version,
}

impl Invalidation {
    pub fn for_readers(readers: Vec<NodeId>, key: &str, version: Version) -> Vec<Invalidation> {
        readers
            .into_iter()
            .map(|reader| Invalidation {
                reader,
                key: key.to_string(),
                version,
            })
            .collect()
    }
}

/// Deliver invalidations and wait for every attempt to finish.
///
/// A lost invalidation is logged, not retried: the holder's TTL bounds how
/// long it may keep serving the old copy. Returns the number delivered.
pub async fn publish_invalidations(
    transport: &Transport,
    from: NodeId,
    cache: &str,
    notices: Vec<Invalidation>,
) -> usize {
    if notices.is_empty() {
        return 0;
    }

    let sends = notices.into_iter().map(|notice| async move {
        let req = PeerRequest::InvalidateNotify {
            cache: cache.to_string(),
            key: notice.key.clone(),
            version: notice.version,
        };
        match transport.request(from, notice.reader, &req).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(
                    reader = notice.reader,
                    key = %notice.key,
                    "Invalidation lost: {}",
                    e
                );
                false
            }
        }
    });

    join_all(sends).await.into_iter().filter(|ok| *ok).count()
}
