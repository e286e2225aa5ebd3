use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: [u8; 20],

    // Directory the target file (and its .download twin) live in.
    pub dir: PathBuf,

    pub listen_address: SocketAddr,

    // Upload budget per peer session, bytes per second.
    pub upload_bps: u64,

    pub max_peers: usize,

    // Fallback announce cadence when the tracker doesn't provide one.
    pub announce_interval: Duration,

    // Floor for retrying after a failed or empty announce.
    pub announce_retry: Duration,

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-LE0010-b71ce4d20a9f";

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            upload_bps: 128 * 1024,
            max_peers: 50,
            announce_interval: Duration::from_secs(1800),
            announce_retry: Duration::from_secs(30),
        }
    }
}
