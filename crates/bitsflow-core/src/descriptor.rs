//! Content descriptors: the manifest that names an artifact.
//!
//! A descriptor lists the artifact's files in path order and the BLAKE3
//! hash of every fixed-size piece of their concatenated bytes. The content
//! hash is derived from the descriptor's info bytes alone, so re-writing a
//! manifest with a new creation date never changes an artifact's identity.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Piece size used for every descriptor built by this node.
pub const PIECE_LENGTH: u64 = 256 * 1024;

/// File name of the manifest inside an artifact directory.
pub const MANIFEST_NAME: &str = "torrent";

/// Optional data sub-directory. When present it is the descriptor root.
pub const DATA_DIR_NAME: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path components relative to the descriptor root.
    pub path: Vec<String>,
    pub length: u64,
}

/// The hashed part of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    /// Hex BLAKE3 hash per piece.
    pub pieces: Vec<String>,
    /// Set for single-file artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Set for directory artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileEntry>,
}

impl Info {
    /// Build a descriptor over a file or a directory tree.
    ///
    /// For directories, a top-level manifest file is skipped so a directory
    /// can carry its own manifest without changing its hash.
    pub fn build_from_path(root: &Path) -> Result<Self, DescriptorError> {
        let meta = fs::metadata(root).map_err(|e| DescriptorError::io(root, e))?;
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DATA_DIR_NAME)
            .to_string();

        let mut hasher = PieceHasher::new(PIECE_LENGTH);

        if meta.is_file() {
            hash_file(root, &mut hasher)?;
            return Ok(Self {
                name,
                piece_length: PIECE_LENGTH,
                pieces: hasher.finish(),
                length: Some(meta.len()),
                files: Vec::new(),
            });
        }

        let mut found = Vec::new();
        collect_files(root, root, &mut found)?;
        if found.is_empty() {
            return Err(DescriptorError::NoFiles(root.to_path_buf()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut files = Vec::with_capacity(found.len());
        for (components, path) in found {
            let length = hash_file(&path, &mut hasher)?;
            files.push(FileEntry {
                path: components,
                length,
            });
        }

        Ok(Self {
            name,
            piece_length: PIECE_LENGTH,
            pieces: hasher.finish(),
            length: None,
            files,
        })
    }

    /// Total payload bytes described.
    pub fn total_length(&self) -> u64 {
        match self.length {
            Some(len) => len,
            None => self.files.iter().map(|f| f.length).sum(),
        }
    }

    /// Canonical encoding the content hash is computed over.
    pub fn info_bytes(&self) -> Vec<u8> {
        // Field order is fixed by the struct, so this is deterministic.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_info(&self.info_bytes())
    }
}

/// A manifest as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub announce_list: Vec<Vec<String>>,
    pub created_by: String,
    pub creation_date: u64,
    pub info: Info,
}

impl Manifest {
    pub fn new(info: Info, trackers: &[String]) -> Self {
        let creation_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            announce_list: if trackers.is_empty() {
                Vec::new()
            } else {
                vec![trackers.to_vec()]
            },
            created_by: concat!("bitsflow/", env!("CARGO_PKG_VERSION")).to_string(),
            creation_date,
            info,
        }
    }

    pub fn content_hash(&self) -> ContentHash {
        self.info.content_hash()
    }

    /// Write the manifest, replacing any previous file at `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), DescriptorError> {
        let text = serde_json::to_vec_pretty(self)
            .map_err(|e| DescriptorError::Serialize(e.to_string()))?;
        fs::write(path, text).map_err(|e| DescriptorError::io(path, e))
    }

    pub fn read_from(path: &Path) -> Result<Self, DescriptorError> {
        let text = fs::read(path).map_err(|e| DescriptorError::io(path, e))?;
        serde_json::from_slice(&text).map_err(|e| DescriptorError::Serialize(e.to_string()))
    }
}

/// Depth-first search for a non-empty regular file. Stops at the first hit.
pub fn contains_data(path: &Path) -> std::io::Result<bool> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len() > 0);
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            if contains_data(&entry?.path())? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ── Internals ────────────────────────────────────────────────────────────────

struct PieceHasher {
    piece_length: usize,
    buf: Vec<u8>,
    pieces: Vec<String>,
}

impl PieceHasher {
    fn new(piece_length: u64) -> Self {
        Self {
            piece_length: piece_length as usize,
            buf: Vec::with_capacity(piece_length as usize),
            pieces: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.piece_length {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        self.pieces.push(blake3::hash(&self.buf).to_hex().to_string());
        self.buf.clear();
    }

    fn finish(mut self) -> Vec<String> {
        if !self.buf.is_empty() {
            self.flush();
        }
        self.pieces
    }
}

fn hash_file(path: &Path, hasher: &mut PieceHasher) -> Result<u64, DescriptorError> {
    let mut file = fs::File::open(path).map_err(|e| DescriptorError::io(path, e))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| DescriptorError::io(path, e))?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(Vec<String>, PathBuf)>,
) -> Result<(), DescriptorError> {
    let entries = fs::read_dir(dir).map_err(|e| DescriptorError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DescriptorError::io(dir, e))?;
        let path = entry.path();
        if dir == root && entry.file_name() == MANIFEST_NAME {
            continue;
        }
        let meta = fs::metadata(&path).map_err(|e| DescriptorError::io(&path, e))?;
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else if meta.is_file() {
            let components = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .iter()
                .map(|c| c.to_string_lossy().into_owned())
                .collect();
            out.push((components, path));
        }
    }
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no files under {0}")]
    NoFiles(PathBuf),
    #[error("failed to (de)serialize manifest: {0}")]
    Serialize(String),
}

impl DescriptorError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
