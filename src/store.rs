use std::{
    fs,
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    ops::Range,
    path::PathBuf,
    sync::Mutex,
};
use rand::seq::IteratorRandom;
use serde_derive::Deserialize;
use crate::{metainfo::MetaInfo, Bitfield};

#[derive(Debug, thiserror::Error)]
pub enum FsError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("piece index {0} out of bounds")]
    PieceOutOfBounds(usize),
}

/// A single file's position within the torrent's virtual, concatenated byte stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "File")]
pub struct FileInfo {

    pub path: PathBuf,

    pub length: usize,

    #[serde(skip)]
    pub offset: usize,

    #[serde(default)]
    pub md5sum: Option<String>,
}

impl FileInfo {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

/// Owns the on-disk file set and arbitrates which piece each peer may work on.
pub struct FileStore {
    files: Vec<FileInfo>,
    output_dir: PathBuf,
    piece_len: usize,
    last_piece_len: usize,
    num_pieces: u32,
    piece_claim: Mutex<Bitfield>,
}

impl FileStore {

    /// Pre-allocates every file to its declared length and starts with an
    /// empty claim bitmap.
    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Result<Self, FsError> {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();

        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        for file in &files {
            let path = output_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut f = OpenOptions::new().create(true).write(true).open(&path)?;
            if file.length > 0 {
                f.seek(SeekFrom::Start(file.length as u64 - 1))?;
                f.write_all(&[0u8])?;
            }
        }

        Ok(Self {
            files,
            output_dir,
            piece_len,
            last_piece_len,
            num_pieces,
            piece_claim: Mutex::new(Bitfield::repeat(false, num_pieces as usize)),
        })
    }

    pub fn num_pieces(&self) -> u32 { self.num_pieces }

    pub fn piece_len(&self) -> usize { self.piece_len }

    /// Length of piece `idx`, accounting for the (possibly shorter) final piece.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    /// Claims an unclaimed piece the peer has, picked uniformly at random.
    /// Scan, pick, and set happen inside one lock with no suspension point.
    pub fn claim_available(&self, remote_have: &Bitfield) -> Option<usize> {
        let mut claim = self.piece_claim.lock().unwrap();
        let candidate = (0..self.num_pieces as usize)
            .filter(|&i| !claim[i] && remote_have.get(i).map(|b| *b).unwrap_or(false))
            .choose(&mut rand::thread_rng())?;
        claim.set(candidate, true);
        Some(candidate)
    }

    /// Clears a claim bit so another session may retry the piece, called
    /// after a hash mismatch or a disk write failure for that piece.
    pub fn release_claim(&self, piece_id: usize) {
        self.piece_claim.lock().unwrap().set(piece_id, false);
    }

    /// Returns the indexes of the first and last file a piece intersects.
    fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");

        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = piece_idx * self.piece_len;
        let end = offset + self.piece_length(piece_idx);

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .expect("piece byte offset exceeds file length");

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&end.saturating_sub(1)))
            .map(|idx| start_file + idx)
            .expect("piece last byte exceeds torrent length");

        start_file..(end_file + 1)
    }

    /// Scatter-writes a verified piece's bytes to every file it overlaps.
    pub fn save_piece(&self, piece_id: usize, bytes: &[u8]) -> Result<(), FsError> {
        if piece_id >= self.num_pieces as usize {
            return Err(FsError::PieceOutOfBounds(piece_id));
        }

        let piece_start = self.piece_byte_offset(piece_id);
        let piece_end = piece_start + bytes.len();

        for idx in self.piece_file_intersections(piece_id) {
            let file = &self.files[idx];
            let file_range = file.byte_range();
            let start = piece_start.max(file_range.start);
            let end = piece_end.min(file_range.end);
            if start >= end {
                continue;
            }

            let path = self.output_dir.join(&file.path);
            let mut f = OpenOptions::new().write(true).open(&path)?;
            f.seek(SeekFrom::Start((start - file_range.start) as u64))?;
            f.write_all(&bytes[start - piece_start..end - piece_start])?;
        }

        Ok(())
    }
}
