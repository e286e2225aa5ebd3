use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use crate::ID;

type Result<T> = std::result::Result<T, TrackerError>;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("error decoding response: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker failure: {0}")]
    Failure(String),

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub client_id: ID,

    // TCP port we accept peer connections on.
    pub port: u16,

    // Byte counters for this session, fed by the peer sessions.
    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete torrent.
    pub left: u64,

    // None for the periodic announces between started and stopped.
    pub event: Option<Event>,

}

// What the coordinator needs out of a successful announce.
#[derive(Debug)]
pub struct Announce {

    pub interval: Option<Duration>,

    pub peers: Vec<SocketAddr>,

}

pub struct Tracker {

    client: reqwest::Client,

    url: Url,

}

impl Tracker {

    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub async fn announce(&self, params: &AnnounceParams) -> Result<Announce> {

        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        tracing::debug!("announce url: {}", url);

        let raw = self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let resp: Response = serde_bencode::from_bytes(&raw)?;
        tracing::debug!("announce response: {:?}", resp);

        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        Ok(Announce {
            interval: resp.interval.map(Duration::from_secs),
            peers: resp.peers,
        })
    }
}

#[derive(Deserialize, Debug, Default)]
struct Response {

    // If present the announce failed and no other key counts.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Processed normally, but the message is worth surfacing.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds to wait before the next periodic announce.
    interval: Option<u64>,

    #[serde(default, deserialize_with = "peers_deserialize")]
    peers: Vec<SocketAddr>,

}

// Trackers answer with either the compact byte string (6 bytes per peer,
// ipv4 + big-endian port) or a list of {ip, port} dicts, regardless of what
// the request asked for. Accept both.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }
            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                let ip = Ipv4Addr::from(v.get_u32());
                let port = v.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

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
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    // Hostname entries are skipped rather than resolved.
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
