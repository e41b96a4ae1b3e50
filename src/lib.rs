#![allow(dead_code)]

mod metainfo;
mod store;
mod torrent;
mod tracker;
mod p2p;
mod block;
mod de;
mod peer_id;

pub const BLOCK_SIZE: usize = 0x4000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use metainfo::{MetaInfo, MetaInfoError};
pub use store::{FileStore, FsError};
pub use torrent::{Supervisor, TorrentConfig, TorrentError};
pub use tracker::{announce, Event, TrackerError};
pub use peer_id::generate_peer_id;
