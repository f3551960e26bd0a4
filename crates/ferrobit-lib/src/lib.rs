pub mod config;
pub mod error;
pub mod progress;
pub mod registry;
pub mod session;
pub mod storage;
pub mod torrent_meta;
pub mod tracker;
pub mod util;

mod buffer;
mod peer;
mod peer_pool;
mod piece;
mod queue;
mod scheduler;

#[cfg(test)]
mod test_util;

use std::{future::Future, time::Duration};

pub use config::SessionConfig;
pub use error::{Error, PeerError, Result, TimedOut};
pub use peer::PeerState;
pub use progress::{PeerSnapshot, Progress, SessionState};
pub use registry::{SessionRegistry, TorrentRecord};
pub use session::{DownloadSummary, TorrentSession};
pub use torrent_meta::{InfoHash, TorrentMeta};

pub(crate) const DEFAULT_BLOCK_SIZE: u32 = 16_384;

pub trait WithTimeout<T, E> {
    /// Fails with [`TimedOut`] if the future doesn't resolve within `timeout`
    fn with_timeout<R>(
        self,
        name: &'static str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = std::result::Result<T, R>> + Send
    where
        Self: Future<Output = std::result::Result<T, E>>,
        R: From<E> + From<TimedOut>;
}

impl<F, T, E> WithTimeout<T, E> for F
where
    F: Future<Output = std::result::Result<T, E>> + Send,
{
    async fn with_timeout<R>(self, name: &'static str, timeout: Duration) -> std::result::Result<T, R>
    where
        R: From<E> + From<TimedOut>,
    {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result.map_err(R::from),
            Err(_) => Err(R::from(TimedOut {
                operation: name,
                after: timeout,
            })),
        }
    }
}
