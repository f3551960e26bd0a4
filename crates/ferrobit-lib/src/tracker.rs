use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use url::Url;

use crate::{Error, Result};

/// Used when a tracker doesn't specify its announce interval
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Serialize)]
pub struct TrackerRequest {
    /// SHA1 hash of the info field in the MetaInfo struct
    #[serde(skip_serializing)]
    info_hash: [u8; 20],
    /// Unique client ID. Randomly generated
    #[serde(skip_serializing)]
    peer_id: [u8; 20],
    /// The port number the client is listening on
    port: u16,
    /// The total amount uploaded
    uploaded: u64,
    /// The total amount downloaded
    downloaded: u64,
    /// The number of bytes the client STILL has to download
    left: u64,
    /// States that the client accepts a compact response. Is always set to 1
    compact: u8,
    /// If omitted - this message is a message sent on a regular basis without any specific event
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<EventType>,
}

impl TrackerRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16, downloaded: u64, left: u64) -> Self {
        TrackerRequest {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded,
            left,
            compact: 1,
            event: None,
        }
    }

    pub fn with_event(mut self, event: EventType) -> Self {
        self.event = Some(event);
        self
    }

    /// The raw 20-byte fields can't go through serde_urlencoded, as it would treat them as a
    /// sequence, so they are percent-encoded by hand.
    pub fn to_query(&self) -> Result<String> {
        let info_hash = form_urlencoded::byte_serialize(&self.info_hash).collect::<String>();
        let peer_id = form_urlencoded::byte_serialize(&self.peer_id).collect::<String>();
        let rest = serde_urlencoded::to_string(self)?;

        Ok(format!("info_hash={}&peer_id={}&{}", info_hash, peer_id, rest))
    }

    /// Appends the announce parameters to `announce`, after any query it already has
    pub fn announce_url(&self, announce: &str) -> Result<Url> {
        let mut url = Url::parse(announce)?;
        let own_query = self.to_query()?;
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, own_query),
            _ => own_query,
        };
        url.set_query(Some(&query));
        Ok(url)
    }
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct TrackerResponse {
    /// A human-readable error
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    /// Number of seconds to wait between regular requests
    interval: Option<u64>,
    /// Number of seeders
    complete: Option<u64>,
    /// Number of leechers
    incomplete: Option<u64>,
    /// List of peers
    #[serde_as(as = "Option<Bytes>")]
    peers: Option<Vec<u8>>,
}

impl TrackerResponse {
    /// Uses compact format as described in [BEP-23](https://www.bittorrent.org/beps/bep_0023.html)
    pub fn get_peers(&self) -> Result<Vec<SocketAddrV4>> {
        let Some(peers) = self.peers.as_ref() else {
            return Ok(Vec::new());
        };
        if peers.len() % 6 != 0 {
            return Err(Error::MalformedPeers(peers.len()));
        }

        // The first 4 bytes are the IP address, and the last 2 are the port
        Ok(peers
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddrV4::new(ip, port)
            })
            .collect())
    }
}

/// A successful announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(TrackerClient { http })
    }

    #[tracing::instrument(level = "debug", err(level = "debug"), skip(self, request))]
    pub async fn announce(&self, announce: &str, request: &TrackerRequest) -> Result<Announce> {
        let url = request.announce_url(announce)?;
        let body = self.http.get(url).send().await?.error_for_status()?.bytes().await?;

        let response: TrackerResponse = serde_bencode::from_bytes(&body)?;
        if let Some(reason) = &response.failure_reason {
            return Err(Error::TrackerFailure(reason.clone()));
        }

        let peers = response.get_peers()?;
        tracing::debug!(
            peers = peers.len(),
            seeders = ?response.complete,
            leechers = ?response.incomplete,
            "tracker responded"
        );

        Ok(Announce {
            interval: response
                .interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL),
            peers,
        })
    }
}
