use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pieces length, must be a non-empty multiple of 20")]
    InvalidPiecesLength,

    #[error("multi-file torrents are not supported")]
    MultiFile,

    #[error("file length and piece geometry disagree")]
    InvalidLength,
}

type Result<T> = std::result::Result<T, MetaInfoError>;

// The info dictionary. Optional keys are kept so that re-encoding reproduces
// the source bytes, and with them the published info-hash; bencode's sorted
// dictionary keys make the encoding canonical.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    pub name: String,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Length of the file in bytes. Absent for multi-file torrents, which we
    // reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

impl Info {
    // SHA1 of the bencoded info dict, identifying the swarm.
    fn info_hash(&self) -> Result<ID> {
        let raw = serde_bencode::to_bytes(self)?;
        let mut hasher = Sha1::new();
        hasher.update(&raw);
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    // The announce URL of the tracker.
    pub announce: Url,

    pub info: Info,

    #[serde(skip)]
    info_hash: ID,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(raw)?;

        if metainfo.info.pieces.is_empty() || metainfo.info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        let total_len = metainfo.info.length.ok_or(MetaInfoError::MultiFile)?;
        let piece_len = metainfo.info.piece_length as u64;
        if total_len == 0 || piece_len == 0 {
            return Err(MetaInfoError::InvalidLength);
        }
        // num_pieces must be exactly ceil(total / piece_len).
        let num_pieces = (metainfo.info.pieces.len() / 20) as u64;
        if num_pieces != (total_len + piece_len - 1) / piece_len {
            return Err(MetaInfoError::InvalidLength);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo loaded: {:?}", metainfo.info);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as the length is checked to be a multiple of 20 on load.
            .map(|chunk| chunk.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize {
        self.info.piece_length as usize
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn total_len(&self) -> u64 {
        self.info.length.unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn announce(&self) -> &Url {
        &self.announce
    }

    pub fn info_hash(&self) -> ID {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

// The pieces blob is noise in logs, so Debug is written out by hand.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("md5sum", &self.md5sum)
            .field("private", &self.private)
            .finish()
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hand-assembled single-file torrent: 4 pieces of 16KiB.
    fn test_torrent_bytes() -> (Vec<u8>, Vec<u8>) {
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi65536e4:name8:test.bin12:piece lengthi16384e6:pieces80:");
        for i in 0..80u8 {
            info.push(i);
        }
        info.push(b'e');

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:info");
        raw.extend_from_slice(&info);
        raw.push(b'e');
        (raw, info)
    }

    #[test]
    fn test_decode() {
        let (raw, _) = test_torrent_bytes();
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();
        assert_eq!(metainfo.name(), "test.bin");
        assert_eq!(metainfo.total_len(), 65536);
        assert_eq!(metainfo.piece_len(), 16384);
        assert_eq!(metainfo.num_pieces(), 4);
        assert_eq!(metainfo.announce().as_str(), "http://tracker.example/announce");
        assert_eq!(metainfo.piece_hashes().len(), 4);
        assert_eq!(metainfo.piece_hashes()[1][0], 20);
    }

    #[test]
    fn test_info_hash_round_trip() {
        let (raw, info) = test_torrent_bytes();
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();

        // Re-encoding the info dict must reproduce the source bytes.
        let encoded = serde_bencode::to_bytes(&metainfo.info).unwrap();
        assert_eq!(encoded, info);

        // And so the info-hash must equal the hash of the raw slice.
        let mut hasher = Sha1::new();
        hasher.update(&info);
        let expected: ID = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    fn wrap_info(info: &str) -> Vec<u8> {
        format!("d8:announce17:http://t.example/4:info{}e", info).into_bytes()
    }

    #[test]
    fn test_reject_multi_file() {
        // A files list instead of a length key.
        let raw = wrap_info(&format!(
            "d5:filesld6:lengthi3e4:pathl1:aeee4:name1:n12:piece lengthi16384e6:pieces20:{}e",
            "a".repeat(20),
        ));
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::MultiFile)
        ));
    }

    #[test]
    fn test_reject_bad_pieces_length() {
        let raw = wrap_info(&format!(
            "d6:lengthi3e4:name1:n12:piece lengthi16384e6:pieces19:{}e",
            "a".repeat(19),
        ));
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::InvalidPiecesLength)
        ));
    }

    #[test]
    fn test_reject_geometry_mismatch() {
        // 40 bytes of hashes claim 2 pieces, but 3 bytes / 16KiB is 1 piece.
        let raw = wrap_info(&format!(
            "d6:lengthi3e4:name1:n12:piece lengthi16384e6:pieces40:{}e",
            "a".repeat(40),
        ));
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::InvalidLength)
        ));
    }
}
