use std::{path::PathBuf, sync::Arc};
use crate::{
    metainfo::{MetaInfo, MetaInfoError},
    p2p::PeerSession,
    peer_id::generate_peer_id,
    store::{FileStore, FsError},
    tracker::{self, AnnounceParams, Event, TrackerError},
};

// The port advertised to the tracker. This client never listens for inbound
// connections, but trackers generally expect a nonzero value.
const ANNOUNCE_PORT: u16 = 8861;
const NUM_WANT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("metainfo error: {0}")]
    MetaInfo(#[from] MetaInfoError),

    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Where the torrent's metainfo comes from and where its files land.
pub struct TorrentConfig {
    pub metainfo_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Owns the shared `TorrentMeta`/`FileStore` for one torrent and drives one
/// `PeerSession` per tracker-provided peer to completion. Launches all
/// sessions concurrently, does not restart failed ones, and does not
/// aggregate their errors: a peer going away just means one fewer source
/// for the pieces it was offering.
pub struct Supervisor {
    meta: Arc<MetaInfo>,
    store: Arc<FileStore>,
    peer_id: [u8; 20],
}

impl Supervisor {
    /// Parses the metainfo at `config.metainfo_path` and pre-allocates the
    /// output layout under `config.output_dir`.
    pub fn new(config: TorrentConfig) -> Result<Self, TorrentError> {
        let metainfo = MetaInfo::new(&config.metainfo_path)?;
        let store = FileStore::new(&metainfo, config.output_dir)?;
        Ok(Supervisor {
            meta: Arc::new(metainfo),
            store: Arc::new(store),
            peer_id: generate_peer_id(),
        })
    }

    /// Announces once to the tracker (`event=started`), then spawns and
    /// awaits one session per returned peer. Only the announce can fail
    /// this run; individual peer sessions fail in isolation.
    #[tracing::instrument(skip(self), fields(info_hash = %self.meta.info_hash_hex()))]
    pub async fn run(&self) -> Result<(), TorrentError> {
        let tracker_url = self.meta.tracker_url()?;

        let params = AnnounceParams {
            info_hash: self.meta.info_hash(),
            peer_id: self.peer_id,
            port: ANNOUNCE_PORT,
            uploaded: 0,
            downloaded: 0,
            left: self.meta.total_len(),
            event: Some(Event::Started),
            num_want: Some(NUM_WANT),
        };

        let peers = tracker::announce(&tracker_url, params).await?;
        tracing::info!(count = peers.len(), "tracker returned peers");

        let mut sessions = Vec::with_capacity(peers.len());
        for address in peers {
            let meta = self.meta.clone();
            let store = self.store.clone();
            let peer_id = self.peer_id;
            sessions.push(tokio::spawn(async move {
                let session = PeerSession::new(address, meta, store, peer_id);
                if let Err(e) = session.run().await {
                    tracing::warn!(%address, error = %e, "peer session ended");
                }
            }));
        }

        for session in sessions {
            // A panicked task is a bug worth surfacing; a session's own
            // protocol/IO errors are already logged above and swallowed here.
            if let Err(e) = session.await {
                tracing::error!(error = %e, "peer task panicked");
            }
        }

        Ok(())
    }
}
