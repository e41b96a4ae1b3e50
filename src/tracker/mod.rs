use std::net::SocketAddr;

mod http;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("response error: {0}")]
    ResponseError(String),
}

#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {

    pub info_hash: [u8; 20],

    pub peer_id: [u8; 20],

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed to complete the download.
    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Event {
    Completed,
    Started,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

/// Performs a single HTTP tracker announce and returns the peer list.
/// Only one announce is ever issued per run: there is no periodic
/// re-announce loop and no tiered failover across trackers.
pub async fn announce(tracker_url: &str, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
    http::announce(tracker_url, params).await
}
