mod session;
mod message;
mod handshake;
pub mod state;

pub use session::PeerSession;

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake sent an unexpected protocol string")]
    IncorrectProtocol,

    #[error("handshake sent an info-hash for a different torrent")]
    IncorrectInfoHash,

    #[error("connection closed before a handshake was received")]
    NoHandshake,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("disk error while saving piece {0}: {1}")]
    Disk(usize, #[source] crate::store::FsError),
}
