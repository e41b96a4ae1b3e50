use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use super::{AnnounceParams, Result, TrackerError};

/// Builds the announce query string and issues a single GET request,
/// returning the peer list from the tracker's bencoded response. Only
/// one announce is ever sent: there is no periodic re-announce loop and
/// no tracker-id carried between calls.
pub async fn announce(tracker_url: &str, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        tracker_url,
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if let Some(event) = params.event {
        url.push_str(&format!("&event={}", event));
    }
    if let Some(num_want) = params.num_want {
        url.push_str(&format!("&numwant={}", num_want));
    }
    tracing::debug!("announce url: {}", url);

    let raw_resp = reqwest::get(&url).await?.bytes().await?;
    let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)?;
    tracing::debug!("announce response: {:#?}", resp);

    if let Some(failure) = resp.failure_reason {
        return Err(TrackerError::ResponseError(failure));
    }
    if let Some(warning) = resp.warning_message {
        tracing::warn!("tracker warning: {}", warning);
    }

    Ok(resp.peers)
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, no other keys are meaningful: a human-readable failure reason.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Present alongside a normally-processed response.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    pub interval: Option<u64>,

    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    // The tracker can return either the compact byte-string model or the
    // dictionary model, irrespective of the requested `compact` parameter.
    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // Compact model: 4 bytes of IP followed by 2 bytes of big-endian port, repeated.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6 bytes"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }

            Ok(peers)
        }

        // Dictionary model: a list of `{ip, port}` dicts.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                if let Ok(ip) = peer.ip.parse::<Ipv4Addr>() {
                    peers.push(SocketAddr::new(IpAddr::V4(ip), peer.port));
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_string() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:completei9e10:incompletei1e8:intervali1800e12:min intervali1800e5:peers12:");
        raw.extend_from_slice(&[97, 117, 154, 184, 0x13, 0x88]); // 97.117.154.184:5000
        raw.extend_from_slice(&[5, 135, 159, 46, 0xc8, 0xd5]);   // 5.135.159.46:51413
        raw.extend_from_slice(b"e");

        let response: HttpResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn failure_reason_surfaces_as_is() {
        let raw = b"d14:failure reason19:torrent not founde";
        let response: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("torrent not found"));
    }
}
