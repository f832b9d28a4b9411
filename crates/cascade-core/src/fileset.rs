//! Payload storage — file headers, chunk mapping, and disk I/O.
//!
//! The chunk sequence is a pure function of the ordered header list and
//! the block size: each file contributes `ceil(length / block)` chunks
//! in ordinal order, chunks never span files, and a zero-length file
//! contributes none. Both ends compute the same layout independently,
//! which is why the header lists must match structurally.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub use crate::wire::FileHeader;

#[derive(Debug, Error)]
pub enum FileSetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("path {0:?} escapes the payload root")]
    PathEscapes(String),

    #[error("payload {0:?} contains no files")]
    EmptyPayload(String),

    #[error("no file with ordinal {0}")]
    UnknownOrdinal(u32),

    #[error("chunk length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: u32, got: usize },
}

// ── Chunk layout ──────────────────────────────────────────────────────────────

/// Maps a `segment_id` to a byte range inside one payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub segment_id: u64,
    pub file_ordinal: u32,
    pub offset: u64,
    pub len: u32,
}

/// Deterministic chunk enumeration for a header list and block size.
pub fn chunk_layout(files: &[FileHeader], block_size: usize) -> Vec<FileChunk> {
    assert!(block_size > 0, "block size must be positive");
    let mut chunks = Vec::new();
    let mut segment_id = 0u64;
    for file in files {
        let mut offset = 0u64;
        while offset < file.length {
            let len = (file.length - offset).min(block_size as u64) as u32;
            chunks.push(FileChunk {
                segment_id,
                file_ordinal: file.ordinal,
                offset,
                len,
            });
            segment_id += 1;
            offset += len as u64;
        }
    }
    chunks
}

// ── Disk file set ─────────────────────────────────────────────────────────────

/// The on-disk side of a payload: the server reads source chunks from
/// it, a receiver writes accepted chunks into it. Single-owner; the
/// chunk writer's one-task discipline is what keeps byte ranges from
/// racing.
pub struct DiskFileSet {
    root: PathBuf,
    files: Vec<FileHeader>,
    chunks: Vec<FileChunk>,
    handles: Vec<Option<File>>,
    writable: bool,
}

impl DiskFileSet {
    /// Server side: enumerate the payload at `rel` below `root`. A file
    /// becomes a single-header payload; a directory is walked
    /// recursively with a stable (sorted, `/`-separated) order.
    pub fn scan(root: &Path, rel: &str, block_size: usize) -> Result<Self, FileSetError> {
        let base = resolve_under(root, rel)?;
        let meta = fs::metadata(&base)?;

        let mut files = Vec::new();
        if meta.is_file() {
            let name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| rel.to_string());
            files.push(FileHeader { name, length: meta.len(), ordinal: 0 });
        } else {
            let mut names = Vec::new();
            collect_files(&base, &base, &mut names)?;
            names.sort();
            for (ordinal, name) in names.into_iter().enumerate() {
                let length = fs::metadata(base.join(&name))?.len();
                files.push(FileHeader {
                    name: name.replace(std::path::MAIN_SEPARATOR, "/"),
                    length,
                    ordinal: ordinal as u32,
                });
            }
        }

        if files.is_empty() {
            return Err(FileSetError::EmptyPayload(rel.to_string()));
        }

        let chunks = chunk_layout(&files, block_size);
        let handles = (0..files.len()).map(|_| None).collect();
        let dir = if meta.is_file() {
            base.parent().map(Path::to_path_buf).unwrap_or(base)
        } else {
            base
        };
        Ok(Self { root: dir, files, chunks, handles, writable: false })
    }

    /// Receiver side: lay out the announced headers below `root/rel`.
    pub fn prepare(
        root: &Path,
        rel: &str,
        files: Vec<FileHeader>,
        block_size: usize,
    ) -> Result<Self, FileSetError> {
        let base = resolve_under(root, rel)?;
        for f in &files {
            // Announced names come off the wire; refuse traversal.
            resolve_under(&base, &f.name)?;
        }
        let chunks = chunk_layout(&files, block_size);
        let handles = (0..files.len()).map(|_| None).collect();
        Ok(Self { root: base, files, chunks, handles, writable: true })
    }

    /// Create every destination file at its announced length.
    pub fn init_write(&mut self) -> Result<(), FileSetError> {
        for file in &self.files {
            let path = self.root.join(&file.name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .truncate(false)
                .open(&path)?;
            handle.set_len(file.length)?;
            self.handles[file.ordinal as usize] = Some(handle);
        }
        tracing::debug!(files = self.files.len(), root = %self.root.display(), "payload initialized for writing");
        Ok(())
    }

    pub fn files(&self) -> &[FileHeader] {
        &self.files
    }

    pub fn enumerate_chunks(&self) -> &[FileChunk] {
        &self.chunks
    }

    pub fn chunk(&self, segment_id: u64) -> Option<&FileChunk> {
        self.chunks.get(segment_id as usize)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    fn handle(&mut self, ordinal: u32) -> Result<&mut File, FileSetError> {
        let idx = ordinal as usize;
        if idx >= self.files.len() {
            return Err(FileSetError::UnknownOrdinal(ordinal));
        }
        if self.handles[idx].is_none() {
            let path = self.root.join(&self.files[idx].name);
            let handle = if self.writable {
                OpenOptions::new().write(true).read(true).open(&path)?
            } else {
                File::open(&path)?
            };
            self.handles[idx] = Some(handle);
        }
        Ok(self.handles[idx].as_mut().unwrap())
    }

    /// Write one received chunk at its mapped range. Rewrites of the
    /// same chunk land on the same bytes, so retransmissions are
    /// harmless.
    pub fn write(&mut self, chunk: &FileChunk, bytes: &[u8]) -> Result<(), FileSetError> {
        if bytes.len() != chunk.len as usize {
            return Err(FileSetError::LengthMismatch { expected: chunk.len, got: bytes.len() });
        }
        let handle = self.handle(chunk.file_ordinal)?;
        handle.seek(SeekFrom::Start(chunk.offset))?;
        handle.write_all(bytes)?;
        Ok(())
    }

    /// Read one source chunk (server side).
    pub fn read_chunk(&mut self, chunk: &FileChunk) -> Result<Vec<u8>, FileSetError> {
        let handle = self.handle(chunk.file_ordinal)?;
        handle.seek(SeekFrom::Start(chunk.offset))?;
        let mut buf = vec![0u8; chunk.len as usize];
        handle.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn flush(&mut self) -> Result<(), FileSetError> {
        for handle in self.handles.iter_mut().flatten() {
            handle.sync_data()?;
        }
        Ok(())
    }

    /// Remove partially written files, e.g. after a payload mismatch.
    pub fn clean(&mut self) -> Result<(), FileSetError> {
        for slot in self.handles.iter_mut() {
            *slot = None;
        }
        for file in &self.files {
            match fs::remove_file(self.root.join(&file.name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(root = %self.root.display(), "partial payload cleaned");
        Ok(())
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), FileSetError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(base, &path, out)?;
        } else if entry.file_type()?.is_file() {
            let rel = path
                .strip_prefix(base)
                .expect("walked path is below its base")
                .to_string_lossy()
                .into_owned();
            out.push(rel);
        }
    }
    Ok(())
}

/// Join `rel` below `root`, rejecting absolute paths and `..` traversal.
fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf, FileSetError> {
    let rel_path = Path::new(rel);
    let clean_components: Vec<_> = rel_path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if clean_components
        .iter()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(FileSetError::PathEscapes(rel.to_string()));
    }
    let mut path = root.to_path_buf();
    for c in clean_components {
        path.push(c);
    }
    Ok(path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
