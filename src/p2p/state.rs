/// The lifecycle of one peer connection, per the leech-only state machine:
/// `Connecting -> Handshaking -> Running -> Closed`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Running,
    Closed,
}

/// Everything a session tracks about its remote peer besides the
/// in-flight piece (see `PeerSession::current_piece`/`current_blocks`).
#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether the peer is choking us; true until an Unchoke arrives.
    pub am_choked: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Connecting,
            am_choked: true,
        }
    }
}
