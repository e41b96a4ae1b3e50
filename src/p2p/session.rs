use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};
use sha1::{Digest, Sha1};
use tokio::{io::{AsyncRead, AsyncWrite}, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt};
use crate::{block, metainfo::MetaInfo, store::FileStore, Bitfield};
use super::{
    handshake::{Handshake, HandshakeCodec, PROTOCOL},
    message::{Message, MessageCodec},
    state::{ConnState, SessionState},
    PeerError, Result,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives a single peer connection end to end: handshake, message framing,
/// piece claiming against the shared `FileStore`, block-request pipelining,
/// and hash verification on piece completion. One instance per remote
/// endpoint; the session is destroyed when its TCP connection ends.
pub struct PeerSession {
    address: SocketAddr,
    meta: Arc<MetaInfo>,
    store: Arc<FileStore>,
    peer_id: [u8; 20],
    state: SessionState,

    // Pieces the remote peer has, learned from BITFIELD and kept current by HAVE.
    remote_have: Option<Bitfield>,

    // The piece currently being assembled, and the blocks still needed for it.
    // Keyed by block offset within the piece so ascending iteration reassembles
    // the piece regardless of the order blocks arrived in.
    current_piece: Option<usize>,
    current_blocks: Option<BTreeMap<u32, Option<Vec<u8>>>>,
}

impl PeerSession {
    pub fn new(address: SocketAddr, meta: Arc<MetaInfo>, store: Arc<FileStore>, peer_id: [u8; 20]) -> Self {
        PeerSession {
            address,
            meta,
            store,
            peer_id,
            state: SessionState::default(),
            remote_have: None,
            current_piece: None,
            current_blocks: None,
        }
    }

    #[tracing::instrument(name = "peer", skip(self), fields(address = %self.address))]
    pub async fn run(mut self) -> Result<()> {
        self.state.conn_state = ConnState::Connecting;
        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;
        tracing::debug!("connected");
        self.drive(stream).await
    }

    /// The protocol state machine, generic over the byte stream so it can be driven
    /// by an in-memory duplex in tests as well as a real `TcpStream` in `run`.
    async fn drive<T: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: T) -> Result<()> {
        self.state.conn_state = ConnState::Handshaking;
        let mut handshake_io = Framed::new(stream, HandshakeCodec);
        self.exchange_handshake(&mut handshake_io).await?;
        tracing::debug!("handshake complete");

        self.state.conn_state = ConnState::Running;
        let mut framed = Framed::new(handshake_io.into_inner(), MessageCodec);
        let result = self.run_message_loop(&mut framed).await;
        self.state.conn_state = ConnState::Closed;
        result
    }

    async fn exchange_handshake<T: AsyncRead + AsyncWrite + Unpin>(&mut self, socket: &mut Framed<T, HandshakeCodec>) -> Result<()> {
        let handshake = Handshake::new(self.meta.info_hash(), self.peer_id);
        socket.send(handshake).await?;

        match socket.next().await {
            Some(Ok(handshake)) => {
                if handshake.protocol != PROTOCOL {
                    return Err(PeerError::IncorrectProtocol);
                }
                if handshake.info_hash != self.meta.info_hash() {
                    return Err(PeerError::IncorrectInfoHash);
                }
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn run_message_loop<T: AsyncRead + AsyncWrite + Unpin>(&mut self, framed: &mut Framed<T, MessageCodec>) -> Result<()> {
        loop {
            match framed.next().await {
                Some(Ok(msg)) => self.handle_message(framed, msg).await?,
                Some(Err(e)) => return Err(e),
                // Peer closed the connection at a frame boundary.
                None => {
                    tracing::debug!("peer disconnected");
                    return Ok(());
                }
            }

            if self.current_piece.is_none() && !self.state.am_choked {
                if !self.try_start_piece(framed).await? {
                    tracing::debug!("no piece left to claim from this peer, closing");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message<T: AsyncRead + AsyncWrite + Unpin>(&mut self, framed: &mut Framed<T, MessageCodec>, msg: Message) -> Result<()> {
        match msg {
            Message::Choke => {
                tracing::trace!("choked");
                self.state.am_choked = true;
            }

            Message::Unchoke => {
                tracing::trace!("unchoked");
                self.state.am_choked = false;
            }

            Message::Bitfield(mut bits) => {
                bits.resize(self.store.num_pieces() as usize, false);
                tracing::debug!(pieces = bits.count_ones(), "bitfield received");
                self.remote_have = Some(bits);
                framed.send(Message::Interested).await?;
            }

            Message::Have { idx } => {
                let num_pieces = self.store.num_pieces() as usize;
                if (idx as usize) >= num_pieces {
                    tracing::warn!(idx, "have message with out-of-range piece index, ignoring");
                    return Ok(());
                }
                let bits = self.remote_have.get_or_insert_with(|| Bitfield::repeat(false, num_pieces));
                bits.set(idx as usize, true);
            }

            Message::Block(block) => self.handle_block(block.piece_idx, block.offset as u32, block.data).await?,

            Message::KeepAlive => tracing::trace!("keep-alive"),

            // We never serve requests or cancels (pure leech); unsolicited Interested/
            // NotInterested/Port messages from the peer don't change our behaviour.
            other => tracing::trace!(message = %other, "ignored"),
        }

        Ok(())
    }

    /// Asks the shared `FileStore` for an unclaimed piece this peer has, and if one
    /// is available, pipelines requests for all of its blocks. Returns `false` when
    /// there is nothing left for this peer to give us.
    async fn try_start_piece<T: AsyncRead + AsyncWrite + Unpin>(&mut self, framed: &mut Framed<T, MessageCodec>) -> Result<bool> {
        let Some(remote_have) = &self.remote_have else {
            return Ok(false);
        };

        let piece_id = match self.store.claim_available(remote_have) {
            Some(id) => id,
            None => return Ok(false),
        };

        let piece_len = self.store.piece_length(piece_id);
        let mut blocks = BTreeMap::new();
        for block_idx in 0..block::num_blocks(piece_len) {
            let begin = block_idx * crate::BLOCK_SIZE as u32;
            let len = block::block_len(piece_len, block_idx as usize);
            blocks.insert(begin, None);
            framed.send(Message::Request(block::BlockInfo {
                piece_idx: piece_id,
                offset: begin as usize,
                len,
            })).await?;
        }

        tracing::debug!(piece_id, blocks = blocks.len(), "requested piece");
        self.current_piece = Some(piece_id);
        self.current_blocks = Some(blocks);
        Ok(true)
    }

    async fn handle_block(&mut self, piece_idx: usize, begin: u32, data: Vec<u8>) -> Result<()> {
        if self.current_piece != Some(piece_idx) {
            tracing::warn!(piece_idx, "block for a piece we aren't assembling, ignoring");
            return Ok(());
        }

        let blocks = self.current_blocks.as_mut().expect("current_blocks set alongside current_piece");
        match blocks.get_mut(&begin) {
            Some(slot) => *slot = Some(data),
            None => {
                tracing::warn!(piece_idx, begin, "block at unexpected offset, ignoring");
                return Ok(());
            }
        }

        if blocks.values().all(Option::is_some) {
            self.complete_piece().await?;
        }

        Ok(())
    }

    /// Concatenates a fully-received piece's blocks in ascending offset order,
    /// verifies it against the metainfo hash, and hands it to `FileStore`. A
    /// failure at either step releases the claim so another peer can retry it.
    async fn complete_piece(&mut self) -> Result<()> {
        let piece_id = self.current_piece.take().expect("current_piece set");
        let blocks = self.current_blocks.take().expect("current_blocks set");

        let mut bytes = Vec::with_capacity(self.store.piece_length(piece_id));
        for (_, block) in blocks {
            bytes.extend_from_slice(&block.expect("all blocks present"));
        }

        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest != self.meta.piece_hash(piece_id) {
            self.store.release_claim(piece_id);
            tracing::warn!(piece_id, "piece failed hash verification");
            return Err(PeerError::HashMismatch(piece_id));
        }

        if let Err(e) = self.store.save_piece(piece_id, &bytes) {
            self.store.release_claim(piece_id);
            return Err(PeerError::Disk(piece_id, e));
        }

        tracing::info!(piece_id, "piece verified and saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncRead, AsyncWrite};

    fn dummy_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
    }

    fn session_for(meta: Arc<MetaInfo>, store: Arc<FileStore>) -> PeerSession {
        PeerSession::new(dummy_addr(), meta, store, [0u8; 20])
    }

    /// Exchanges the handshake on the peer's side of a duplex stream and
    /// hands back a message-level framed connection, as a real remote peer
    /// driving the same protocol would see it.
    async fn fake_peer_handshake<T: AsyncRead + AsyncWrite + Unpin>(
        stream: T,
        info_hash: [u8; 20],
    ) -> Framed<T, MessageCodec> {
        let mut hs = Framed::new(stream, HandshakeCodec);
        let client_hs = hs.next().await.expect("stream open").expect("valid handshake");
        assert_eq!(client_hs.info_hash, info_hash);
        assert_eq!(client_hs.protocol, PROTOCOL);

        hs.send(Handshake::new(info_hash, [1u8; 20])).await.unwrap();
        Framed::new(hs.into_inner(), MessageCodec)
    }

    fn fixture(path: &str) -> (Arc<MetaInfo>, tempfile::TempDir, Arc<FileStore>) {
        let meta = MetaInfo::new(path).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&meta, dir.path().to_path_buf()).unwrap();
        (Arc::new(meta), dir, Arc::new(store))
    }

    // Scenario 1: single file, single piece, single block. A bitfield
    // announcing the one piece, an unchoke, then the matching block ends
    // the session cleanly once the piece is exhausted.
    #[tokio::test]
    async fn single_block_piece_is_saved_and_session_exits_when_exhausted() {
        let (meta, dir, store) = fixture("tests/fixtures/session_single.torrent");
        let content = std::fs::read("tests/fixtures/session_single.content").unwrap();
        let info_hash = meta.info_hash();

        let (client, peer) = tokio::io::duplex(64 * 1024);

        let peer_task = tokio::spawn(async move {
            let mut framed = fake_peer_handshake(peer, info_hash).await;

            let mut have = Bitfield::repeat(false, 1);
            have.set(0, true);
            framed.send(Message::Bitfield(have)).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            assert_eq!(framed.next().await.unwrap().unwrap(), Message::Interested);
            match framed.next().await.unwrap().unwrap() {
                Message::Request(block) => {
                    assert_eq!(block.piece_idx, 0);
                    assert_eq!(block.offset, 0);
                    assert_eq!(block.len, 100);
                }
                other => panic!("unexpected message: {:?}", other),
            }

            framed.send(Message::Block(block::BlockData {
                piece_idx: 0,
                offset: 0,
                data: content,
            })).await.unwrap();
        });

        let mut session = session_for(meta.clone(), store.clone());
        session.drive(client).await.expect("session ends cleanly, not with an error");
        peer_task.await.unwrap();

        let saved = std::fs::read(dir.path().join("single.bin")).unwrap();
        assert_eq!(saved, std::fs::read("tests/fixtures/session_single.content").unwrap());

        // The piece is claimed and complete; nothing left for another peer to take.
        assert_eq!(store.claim_available(&Bitfield::repeat(true, 1)), None);
    }

    // Scenario 3: out-of-order blocks. Reassembly keys on `begin`, not
    // arrival order, so sending the second block before the first must
    // still produce a correctly hashed, correctly ordered piece.
    #[tokio::test]
    async fn blocks_reassemble_in_offset_order_regardless_of_arrival_order() {
        let (meta, dir, store) = fixture("tests/fixtures/session_multiblock.torrent");
        let content = std::fs::read("tests/fixtures/session_multiblock.content").unwrap();
        let info_hash = meta.info_hash();

        let second_block = content[crate::BLOCK_SIZE..].to_vec();
        let first_block = content[..crate::BLOCK_SIZE].to_vec();

        let (client, peer) = tokio::io::duplex(64 * 1024);

        let peer_task = tokio::spawn(async move {
            let mut framed = fake_peer_handshake(peer, info_hash).await;

            let mut have = Bitfield::repeat(false, 1);
            have.set(0, true);
            framed.send(Message::Bitfield(have)).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            assert_eq!(framed.next().await.unwrap().unwrap(), Message::Interested);
            // Two requests arrive, pipelined; reply to the second block first.
            framed.next().await.unwrap().unwrap();
            framed.next().await.unwrap().unwrap();

            framed.send(Message::Block(block::BlockData {
                piece_idx: 0,
                offset: crate::BLOCK_SIZE,
                data: second_block,
            })).await.unwrap();
            framed.send(Message::Block(block::BlockData {
                piece_idx: 0,
                offset: 0,
                data: first_block,
            })).await.unwrap();
        });

        let mut session = session_for(meta.clone(), store.clone());
        session.drive(client).await.expect("session ends cleanly");
        peer_task.await.unwrap();

        let saved = std::fs::read(dir.path().join("multiblock.bin")).unwrap();
        assert_eq!(saved, content);
    }

    // Scenario 4: hash mismatch. A peer that returns bytes not matching the
    // metainfo's digest must not have those bytes written, and the session
    // ends with an error rather than silently continuing.
    #[tokio::test]
    async fn hash_mismatch_does_not_write_and_releases_the_claim() {
        let (meta, dir, store) = fixture("tests/fixtures/session_single.torrent");
        let info_hash = meta.info_hash();

        let (client, peer) = tokio::io::duplex(64 * 1024);

        let peer_task = tokio::spawn(async move {
            let mut framed = fake_peer_handshake(peer, info_hash).await;

            let mut have = Bitfield::repeat(false, 1);
            have.set(0, true);
            framed.send(Message::Bitfield(have)).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            framed.next().await.unwrap().unwrap(); // Interested
            framed.next().await.unwrap().unwrap(); // Request

            framed.send(Message::Block(block::BlockData {
                piece_idx: 0,
                offset: 0,
                data: vec![0xFFu8; 100],
            })).await.unwrap();
        });

        let mut session = session_for(meta.clone(), store.clone());
        let result = session.drive(client).await;
        assert!(matches!(result, Err(PeerError::HashMismatch(0))));
        peer_task.await.unwrap();

        let on_disk = std::fs::read(dir.path().join("single.bin")).unwrap();
        assert!(on_disk.iter().all(|&b| b == 0), "mismatched piece must not be written");

        // The claim was released, so the piece is selectable again.
        let mut have = Bitfield::repeat(false, 1);
        have.set(0, true);
        assert_eq!(store.claim_available(&have), Some(0));
    }

    // Scenario 7: a HAVE arriving after an (empty) bitfield makes that
    // piece claimable, since HAVE updates are folded into `remote_have`.
    #[tokio::test]
    async fn have_after_bitfield_makes_the_piece_claimable() {
        let (meta, dir, store) = fixture("tests/fixtures/session_single.torrent");
        let content = std::fs::read("tests/fixtures/session_single.content").unwrap();
        let info_hash = meta.info_hash();

        let (client, peer) = tokio::io::duplex(64 * 1024);

        let peer_task = tokio::spawn(async move {
            let mut framed = fake_peer_handshake(peer, info_hash).await;

            framed.send(Message::Bitfield(Bitfield::repeat(false, 1))).await.unwrap();
            assert_eq!(framed.next().await.unwrap().unwrap(), Message::Interested);

            framed.send(Message::Have { idx: 0 }).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            match framed.next().await.unwrap().unwrap() {
                Message::Request(block) => assert_eq!(block.piece_idx, 0),
                other => panic!("unexpected message: {:?}", other),
            }

            framed.send(Message::Block(block::BlockData {
                piece_idx: 0,
                offset: 0,
                data: content,
            })).await.unwrap();
        });

        let mut session = session_for(meta.clone(), store.clone());
        session.drive(client).await.expect("session ends cleanly");
        peer_task.await.unwrap();

        assert!(dir.path().join("single.bin").exists());
    }

    // A handshake carrying a different info-hash is rejected outright
    // rather than silently proceeding against the wrong torrent.
    #[tokio::test]
    async fn mismatched_info_hash_in_handshake_is_rejected() {
        let (meta, _dir, store) = fixture("tests/fixtures/session_single.torrent");

        let (client, peer) = tokio::io::duplex(1024);
        let peer_task = tokio::spawn(async move {
            let mut hs = Framed::new(peer, HandshakeCodec);
            hs.next().await.unwrap().unwrap();
            hs.send(Handshake::new([0xAAu8; 20], [1u8; 20])).await.unwrap();
        });

        let mut session = session_for(meta.clone(), store.clone());
        let result = session.drive(client).await;
        assert!(matches!(result, Err(PeerError::IncorrectInfoHash)));
        peer_task.await.unwrap();
    }
}
