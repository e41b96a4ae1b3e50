use rand::Rng;

const PREFIX: &str = "-MW-";
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a fresh 20-byte peer-id: `-MW-` followed by 16 random `[a-z0-9]` characters.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..4].copy_from_slice(PREFIX.as_bytes());

    let mut rng = rand::thread_rng();
    for byte in &mut id[4..] {
        *byte = CHARSET[rng.gen_range(0..CHARSET.len())];
    }
    id
}
