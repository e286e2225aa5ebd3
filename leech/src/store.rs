use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};
use sha1::{Digest, Sha1};
use crate::{block::BlockInfo, metainfo::MetaInfo, Bitfield, ID};

// Torrent piece geometry, cheap to clone and shared widely.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, <= piece_len.
    pub last_piece_len: usize,

    pub num_pieces: usize,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo) -> Self {
        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
        }
    }

    // Returns the length of a piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }
}

// Byte-addressable access to the single target file, with piece-granularity
// hash verification and crash-safe resume.
//
// On disk the torrent is either `<name>` (complete) or `<name>.download`
// (in progress, exactly total_len bytes, sparse permitted).
#[derive(Debug)]
pub struct PieceStore {

    info: StoreInfo,

    piece_hashes: Vec<ID>,

    // Positional IO seeks under the lock, so reads take the write guard too.
    file: RwLock<fs::File>,

    download_path: PathBuf,

    final_path: PathBuf,

}

impl PieceStore {

    // Opens or creates the backing file and reports which pieces are already
    // verified on disk. The zero bits of the returned bitfield are the
    // missing set.
    pub fn open(
        dir: &Path,
        name: &str,
        info: StoreInfo,
        piece_hashes: Vec<ID>,
    ) -> io::Result<(PieceStore, Bitfield)> {

        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
            tracing::info!("created missing output directory: {:?}", dir);
        }
        let final_path = dir.join(name);
        let download_path = dir.join(format!("{}.download", name));

        // Finished file already in place: nothing to download.
        if let Ok(meta) = fs::metadata(&final_path) {
            if meta.is_file() && meta.len() == info.total_len {
                tracing::info!("{:?} already complete", final_path);
                let file = fs::OpenOptions::new().read(true).open(&final_path)?;
                let have = Bitfield::repeat(true, info.num_pieces);
                let store = PieceStore {
                    info,
                    piece_hashes,
                    file: RwLock::new(file),
                    download_path,
                    final_path,
                };
                return Ok((store, have));
            }
        }

        let resumable = fs::metadata(&download_path)
            .map(|meta| meta.is_file() && meta.len() == info.total_len)
            .unwrap_or(false);

        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&download_path)?;
        if !resumable {
            // Fresh download file, exactly total_len bytes.
            file.set_len(info.total_len)?;
        }

        let num_pieces = info.num_pieces;
        let store = PieceStore {
            info,
            piece_hashes,
            file: RwLock::new(file),
            download_path,
            final_path,
        };

        let have = if resumable {
            store.scan()?
        } else {
            Bitfield::repeat(false, num_pieces)
        };
        Ok((store, have))
    }

    // Resume scan: hash every piece in the partial file against the metainfo.
    fn scan(&self) -> io::Result<Bitfield> {
        let mut have = Bitfield::repeat(false, self.info.num_pieces);
        for idx in 0..self.info.num_pieces {
            let data = self.read(self.info.piece_offset(idx), self.info.piece_length(idx))?;
            let mut hasher = Sha1::new();
            hasher.update(&data);
            if hasher.finalize().as_slice() == self.piece_hashes[idx] {
                have.set(idx, true);
            }
        }
        tracing::info!(
            "resume scan verified {}/{} pieces",
            have.count_ones(),
            self.info.num_pieces,
        );
        Ok(have)
    }

    pub fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        debug_assert!(offset + len as u64 <= self.info.total_len);
        let mut buf = vec![0; len];
        let mut file = self.file.write().map_err(poisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        debug_assert!(offset + data.len() as u64 <= self.info.total_len);
        let mut file = self.file.write().map_err(poisoned)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    // Persists a fully verified piece.
    pub fn write_piece(&self, idx: usize, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), self.info.piece_length(idx));
        self.write(self.info.piece_offset(idx), data)
    }

    pub fn read_block(&self, block: &BlockInfo) -> io::Result<Vec<u8>> {
        self.read(
            self.info.piece_offset(block.piece_idx) + block.offset as u64,
            block.len,
        )
    }

    pub fn piece_sha(&self, idx: usize) -> ID {
        self.piece_hashes[idx]
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    // Every piece is verified and on disk: drop the .download suffix so the
    // next open takes the complete path.
    pub fn finalize(&self) -> io::Result<()> {
        fs::rename(&self.download_path, &self.final_path)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "file lock poisoned")
}
