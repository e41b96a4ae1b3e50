use serde_derive::Deserialize;
use crate::store::FileInfo;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("no usable http tracker url found in announce/announce-list")]
    NoUsableTracker,

    #[error("malformed info dict: {0}")]
    MalformedInfoDict(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct Info {
    pub name: String,

    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default)]
    pub md5sum: Option<String>,

    #[serde(default)]
    pub length: Option<u64>,

    #[serde(default)]
    pub files: Option<Vec<File>>,

    #[serde(default)]
    pub private: Option<u8>,
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    pub info_hash: [u8; 20],

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let raw = std::fs::read(path)?;
        let mut metainfo: MetaInfo = serde_bencode::from_bytes(&raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        metainfo.info_hash = info_hash_from_raw(&raw)?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe, length checked to be a multiple of 20 in `new`.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_hash(&self, idx: usize) -> [u8; 20] {
        let start = idx * 20;
        self.info.pieces[start..start + 20].try_into().unwrap()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    /// Selects the single tracker URL to announce to: `announce` if it's http(s),
    /// otherwise the first `announce-list` entry starting with "http" and ending
    /// in "announce". Only one tracker is ever contacted per run.
    pub fn tracker_url(&self) -> Result<String, MetaInfoError> {
        if self.announce.as_str().starts_with("http") {
            return Ok(self.announce.to_string());
        }

        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    let s = url.as_str();
                    if s.starts_with("http") && s.ends_with("announce") {
                        return Ok(s.to_string());
                    }
                }
            }
        }

        Err(MetaInfoError::NoUsableTracker)
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.join("/").into(),
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Locates the raw byte span of the `info` dictionary's value within the
/// original file bytes and hashes it directly, without decoding and
/// re-encoding it (which would not reproduce the original byte-exact form).
fn info_hash_from_raw(raw: &[u8]) -> Result<[u8; 20], MetaInfoError> {
    use sha1::Digest;

    if raw.first() != Some(&b'd') {
        return Err(MetaInfoError::MalformedInfoDict("not a dict"));
    }

    let mut pos = 1;
    loop {
        if pos >= raw.len() {
            return Err(MetaInfoError::MalformedInfoDict("unterminated dict"));
        }
        if raw[pos] == b'e' {
            break;
        }

        let (key, next) = read_bencode_string(raw, pos)?;
        let value_start = next;
        let value_end = skip_bencode_value(raw, value_start)?;

        if key == b"info" {
            let mut hasher = sha1::Sha1::new();
            hasher.update(&raw[value_start..value_end]);
            return Ok(hasher.finalize().into());
        }

        pos = value_end;
    }

    Err(MetaInfoError::MalformedInfoDict("no info key"))
}

/// Reads a bencoded byte-string `<len>:<bytes>` starting at `pos`, returning
/// its content and the position immediately after it.
fn read_bencode_string(raw: &[u8], pos: usize) -> Result<(&[u8], usize), MetaInfoError> {
    let colon = raw[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or(MetaInfoError::MalformedInfoDict("missing string length"))?
        + pos;

    let len: usize = std::str::from_utf8(&raw[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(MetaInfoError::MalformedInfoDict("bad string length"))?;

    let start = colon + 1;
    let end = start + len;
    if end > raw.len() {
        return Err(MetaInfoError::MalformedInfoDict("string overruns buffer"));
    }
    Ok((&raw[start..end], end))
}

/// Returns the end offset of the bencoded value starting at `pos`, without
/// allocating a parsed representation of it.
fn skip_bencode_value(raw: &[u8], pos: usize) -> Result<usize, MetaInfoError> {
    match raw.get(pos) {
        Some(b'i') => {
            let end = raw[pos..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or(MetaInfoError::MalformedInfoDict("unterminated integer"))?
                + pos;
            Ok(end + 1)
        }
        Some(b'l') => {
            let mut cur = pos + 1;
            while raw.get(cur) != Some(&b'e') {
                cur = skip_bencode_value(raw, cur)?;
            }
            Ok(cur + 1)
        }
        Some(b'd') => {
            let mut cur = pos + 1;
            while raw.get(cur) != Some(&b'e') {
                let (_, next) = read_bencode_string(raw, cur)?;
                cur = skip_bencode_value(raw, next)?;
            }
            Ok(cur + 1)
        }
        Some(b'0'..=b'9') => {
            let (_, next) = read_bencode_string(raw, pos)?;
            Ok(next)
        }
        _ => Err(MetaInfoError::MalformedInfoDict("unknown value tag")),
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v| v.as_str()).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date)
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Don't want to print out the pieces field, so implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
