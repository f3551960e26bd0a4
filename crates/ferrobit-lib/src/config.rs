use std::time::Duration;

use crate::DEFAULT_BLOCK_SIZE;

/// Tunables of a torrent session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Port reported to the tracker
    pub listen_port: u16,
    pub connect_timeout: Duration,
    /// Applies to every socket read and write, and to waiting for work
    pub io_timeout: Duration,
    /// Total connection attempts per peer, including the first one
    pub connect_attempts: usize,
    /// Delay before the next connection attempt, multiplied by the number of failed attempts
    pub retry_backoff: Duration,
    /// Maximum number of unanswered block requests per connection
    pub max_backlog: usize,
    pub block_size: u32,
    /// A connection is closed once this many of the pieces it delivered failed hash verification
    pub max_rejected_pieces: usize,
    /// Maximum number of concurrent peer connections
    pub max_peers: usize,
    pub tracker_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            listen_port: 6881,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            connect_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            max_backlog: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            max_rejected_pieces: 5,
            max_peers: 50,
            tracker_timeout: Duration::from_secs(15),
        }
    }
}
