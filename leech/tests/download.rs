// End to end: a crafted torrent, a mock HTTP tracker handing out one compact
// peer, and a scripted seeder speaking the wire protocol over real TCP.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use leech::{Config, TorrentStatus};

const PIECE_LEN: usize = 16384;
const NUM_PIECES: usize = 4;

// The salt keeps the two tests' info-hashes apart in the process registry.
fn test_content(salt: u8) -> Vec<u8> {
    (0..NUM_PIECES * PIECE_LEN)
        .map(|i| (i % 251) as u8 ^ salt)
        .collect()
}

fn piece_hashes(content: &[u8]) -> Vec<u8> {
    let mut hashes = Vec::new();
    for piece in content.chunks(PIECE_LEN) {
        let mut hasher = Sha1::new();
        hasher.update(piece);
        hashes.extend_from_slice(&hasher.finalize());
    }
    hashes
}

// Bencoded single-file torrent plus the raw info dict it contains.
fn torrent_bytes(announce: &str, content: &[u8]) -> (Vec<u8>, [u8; 20]) {
    let mut info = Vec::new();
    info.extend_from_slice(
        format!("d6:lengthi{}e4:name8:test.bin12:piece lengthi{}e6:pieces{}:",
            content.len(),
            PIECE_LEN,
            NUM_PIECES * 20,
        )
        .as_bytes(),
    );
    info.extend_from_slice(&piece_hashes(content));
    info.push(b'e');

    let mut hasher = Sha1::new();
    hasher.update(&info);
    let info_hash: [u8; 20] = hasher.finalize().into();

    let mut raw = Vec::new();
    raw.extend_from_slice(format!("d8:announce{}:{}4:info", announce.len(), announce).as_bytes());
    raw.extend_from_slice(&info);
    raw.push(b'e');
    (raw, info_hash)
}

// Minimal HTTP tracker: every announce gets interval 1800 and the one seeder.
async fn run_tracker(listener: TcpListener, seeder_port: u16) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else { return };

        // Drain the request head.
        let mut buf = [0u8; 2048];
        let mut request = Vec::new();
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }

        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&seeder_port.to_be_bytes());
        body.push(b'e');

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len(),
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.write_all(&body).await;
    }
}

// Scripted seeder: handshake, bitfield of all pieces, unchoke on interest,
// serve every request from the content buffer.
async fn run_seeder(
    listener: TcpListener,
    info_hash: [u8; 20],
    content: Arc<Vec<u8>>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else { return };
        connections.fetch_add(1, Ordering::SeqCst);
        let content = Arc::clone(&content);
        tokio::spawn(async move {
            let _ = serve_peer(stream, info_hash, &content).await;
        });
    }
}

async fn serve_peer(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    content: &[u8],
) -> std::io::Result<()> {

    // Handshake exchange.
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await?;
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    assert_eq!(&handshake[28..48], &info_hash);

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(b"-MK0001-seederseeder");
    stream.write_all(&reply).await?;

    // Bitfield: all four pieces, high bits of a single byte.
    stream.write_all(&[0, 0, 0, 2, 5, 0xf0]).await?;

    loop {
        let mut prefix = [0u8; 4];
        if stream.read_exact(&mut prefix).await.is_err() {
            return Ok(());
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;

        match frame[0] {
            // interested -> unchoke
            2 => stream.write_all(&[0, 0, 0, 1, 1]).await?,
            // request -> piece
            6 => {
                let idx = u32::from_be_bytes(frame[1..5].try_into().unwrap()) as usize;
                let begin = u32::from_be_bytes(frame[5..9].try_into().unwrap()) as usize;
                let length = u32::from_be_bytes(frame[9..13].try_into().unwrap()) as usize;
                let start = idx * PIECE_LEN + begin;

                let mut block = Vec::with_capacity(13 + length);
                block.extend_from_slice(&(9 + length as u32).to_be_bytes());
                block.push(7);
                block.extend_from_slice(&(idx as u32).to_be_bytes());
                block.extend_from_slice(&(begin as u32).to_be_bytes());
                block.extend_from_slice(&content[start..start + length]);
                stream.write_all(&block).await?;
            }
            // everything else (have, cancel, not interested) is ignored
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_peer_full_download() {

    let dir = TempDir::new().unwrap();
    let content = Arc::new(test_content(0));

    let seeder_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_port = seeder_listener.local_addr().unwrap().port();
    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tracker_port = tracker_listener.local_addr().unwrap().port();

    let announce = format!("http://127.0.0.1:{}/announce", tracker_port);
    let (torrent, info_hash) = torrent_bytes(&announce, &content);
    let torrent_path = dir.path().join("test.torrent");
    std::fs::write(&torrent_path, &torrent).unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    tokio::spawn(run_tracker(tracker_listener, seeder_port));
    tokio::spawn(run_seeder(
        seeder_listener,
        info_hash,
        Arc::clone(&content),
        Arc::clone(&connections),
    ));

    let config = Config {
        dir: dir.path().join("out"),
        listen_address: "127.0.0.1:0".parse().unwrap(),
        ..Config::default()
    };

    let mut handle = leech::download(&torrent_path, config).unwrap();
    assert_eq!(handle.info_hash(), info_hash);
    assert_eq!(handle.wait().await, TorrentStatus::Complete);

    // The finished file has been renamed into place with the right bytes.
    let out = dir.path().join("out").join("test.bin");
    assert_eq!(std::fs::read(&out).unwrap(), *content);
    assert!(!dir.path().join("out").join("test.bin.download").exists());

    // The compact peer blob produced exactly one outbound connection.
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    // The coordinator removed itself from the registry on completion.
    assert!(leech::find(&info_hash).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_complete_on_open_makes_no_connections() {

    let dir = TempDir::new().unwrap();
    let content = Arc::new(test_content(0x5a));

    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tracker_port = tracker_listener.local_addr().unwrap().port();
    let announce = format!("http://127.0.0.1:{}/announce", tracker_port);
    let (torrent, _) = torrent_bytes(&announce, &content);
    let torrent_path = dir.path().join("test.torrent");
    std::fs::write(&torrent_path, &torrent).unwrap();

    // The finished file is already in place.
    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    std::fs::write(out_dir.join("test.bin"), content.as_slice()).unwrap();

    // No tracker is running behind the listener; a coordinator that tried to
    // announce would fail, a complete one never gets that far.
    drop(tracker_listener);

    let config = Config {
        dir: out_dir,
        listen_address: "127.0.0.1:0".parse().unwrap(),
        ..Config::default()
    };
    let mut handle = leech::download(&torrent_path, config).unwrap();
    assert_eq!(handle.wait().await, TorrentStatus::Complete);
}
