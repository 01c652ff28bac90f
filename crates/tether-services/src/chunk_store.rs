//! Chunk store: fixed-size chunking on the send side, out-of-order chunk
//! writes on the receive side.
//!
//! Sending reads through `ChunkSource`, which hands out `Bytes` slices of one
//! shared buffer. For files that buffer is the read-only memory map itself,
//! so producing a chunk never copies or allocates.
//!
//! Receiving goes through a `ChunkSink`:
//!   - `ChunkAssembler` keeps message chunks in memory and joins them.
//!   - `DirectFileSink` does one positioned write per chunk (small files).
//!   - `WindowedFileSink` maps the destination in windows of K chunks and
//!     keeps at most W of them resident, evicting least-recently-used
//!     windows after flushing them (large files).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use memmap2::{Mmap, MmapMut, MmapOptions};

use tether_core::config::FileTransferSettings;

/// Number of `chunk_size` chunks needed for `len` bytes.
pub fn chunk_count(len: u64, chunk_size: usize) -> io::Result<u32> {
    if chunk_size == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "chunk size is zero"));
    }
    u32::try_from(len.div_ceil(chunk_size as u64)).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{len} bytes needs more than u32::MAX chunks"),
        )
    })
}

// ── Send side ─────────────────────────────────────────────────────────────────

/// Random-access view of a payload as fixed-size chunks.
#[derive(Clone)]
pub struct ChunkSource {
    data: Bytes,
    chunk_size: usize,
    chunks: u32,
}

impl std::fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSource")
            .field("len", &self.data.len())
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.chunks)
            .finish()
    }
}

impl ChunkSource {
    pub fn from_bytes(data: Bytes, chunk_size: usize) -> io::Result<Self> {
        let chunks = chunk_count(data.len() as u64, chunk_size)?;
        Ok(Self {
            data,
            chunk_size,
            chunks,
        })
    }

    /// Memory-map `path` read-only. Chunks are slices of the mapping.
    pub fn map_file(path: &Path, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            // Zero-length mappings are rejected on several platforms.
            return Self::from_bytes(Bytes::new(), chunk_size);
        }

        // Safety: the file is opened read-only and the mapping is never
        // written through. Truncation by another process while a transfer
        // runs is outside what this crate can guard against.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(Bytes::from_owner(mmap), chunk_size)
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks
    }

    /// Chunk `seq`, or None past the end. The last chunk may be short.
    pub fn chunk(&self, seq: u32) -> Option<Bytes> {
        if seq >= self.chunks {
            return None;
        }
        let start = seq as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        Some(self.data.slice(start..end))
    }
}

// ── Receive side ──────────────────────────────────────────────────────────────

/// Destination for chunks arriving in any order.
///
/// Writes take `&mut self`, so a sink never sees two writes at once and a
/// mapped window is never unmapped while a copy into it is in progress.
pub trait ChunkSink: Send + Sync {
    fn write_chunk(&mut self, seq: u32, data: &[u8]) -> io::Result<()>;

    /// Flush everything written so far to stable storage.
    fn finish(&mut self) -> io::Result<()>;

    fn kind(&self) -> &'static str;
}

/// In-memory reassembly for messages.
#[derive(Debug)]
pub struct ChunkAssembler {
    chunks: Vec<Option<Bytes>>,
    received: u32,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            chunks: vec![None; total_chunks as usize],
            received: 0,
        }
    }

    /// Store a chunk. Returns false for duplicates and out-of-range ids.
    pub fn insert(&mut self, seq: u32, data: Bytes) -> bool {
        match self.chunks.get_mut(seq as usize) {
            Some(slot @ None) => {
                *slot = Some(data);
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received as usize == self.chunks.len()
    }

    /// Join chunks 0..total in order. None until every chunk is present.
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let len = self.chunks.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for chunk in self.chunks.iter().flatten() {
            out.extend_from_slice(chunk);
        }
        Some(out.freeze())
    }
}

/// Positioned writes straight into a pre-sized file.
pub struct DirectFileSink {
    file: File,
    file_size: u64,
    chunk_size: usize,
}

impl DirectFileSink {
    pub fn new(file: File, file_size: u64, chunk_size: usize) -> Self {
        Self {
            file,
            file_size,
            chunk_size,
        }
    }
}

impl ChunkSink for DirectFileSink {
    fn write_chunk(&mut self, seq: u32, data: &[u8]) -> io::Result<()> {
        let offset = seq as u64 * self.chunk_size as u64;
        check_bounds(offset, data.len(), self.file_size)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}

struct Window {
    map: MmapMut,
    first_seq: u32,
    dirty: bool,
    last_used: u64,
}

/// LRU-bounded set of writable mapped windows over a pre-sized file.
pub struct WindowedFileSink {
    file: File,
    file_size: u64,
    chunk_size: usize,
    chunks_per_window: u32,
    max_windows: usize,
    windows: HashMap<u32, Window>,
    clock: u64,
    evictions: u64,
}

impl WindowedFileSink {
    pub fn new(
        file: File,
        file_size: u64,
        chunk_size: usize,
        chunks_per_window: u32,
        max_windows: usize,
    ) -> Self {
        Self {
            file,
            file_size,
            chunk_size,
            chunks_per_window: chunks_per_window.max(1),
            max_windows: max_windows.max(1),
            windows: HashMap::new(),
            clock: 0,
            evictions: 0,
        }
    }

    fn chunk_to_window(&self, seq: u32) -> u32 {
        seq / self.chunks_per_window
    }

    fn window_bytes(&self) -> u64 {
        self.chunks_per_window as u64 * self.chunk_size as u64
    }

    pub fn resident_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Fetch window `index`, mapping it (and evicting the LRU window if the
    /// resident set is full) when it is not resident.
    fn window(&mut self, index: u32) -> io::Result<&mut Window> {
        self.clock += 1;
        if !self.windows.contains_key(&index) {
            if self.windows.len() >= self.max_windows {
                self.evict_lru()?;
            }
            let offset = index as u64 * self.window_bytes();
            if offset >= self.file_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("window {index} starts past end of file"),
                ));
            }
            let len = self.window_bytes().min(self.file_size - offset) as usize;

            // Safety: the file was opened read-write by this sink and is not
            // shared with any other mapping in this process. memmap2 aligns
            // the offset down to a page boundary internally.
            let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file)? };
            tracing::trace!(window = index, offset, len, "mapped receive window");
            self.windows.insert(
                index,
                Window {
                    map,
                    first_seq: index * self.chunks_per_window,
                    dirty: false,
                    last_used: self.clock,
                },
            );
        }

        let clock = self.clock;
        let window = self
            .windows
            .get_mut(&index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "window vanished"))?;
        window.last_used = clock;
        Ok(window)
    }

    fn evict_lru(&mut self) -> io::Result<()> {
        let Some(victim) = self
            .windows
            .iter()
            .min_by_key(|(_, w)| w.last_used)
            .map(|(index, _)| *index)
        else {
            return Ok(());
        };
        if let Some(window) = self.windows.get(&victim) {
            if window.dirty {
                window.map.flush()?;
            }
        }
        self.windows.remove(&victim);
        self.evictions += 1;
        tracing::trace!(window = victim, "evicted receive window");
        Ok(())
    }
}

impl ChunkSink for WindowedFileSink {
    fn write_chunk(&mut self, seq: u32, data: &[u8]) -> io::Result<()> {
        let global = seq as u64 * self.chunk_size as u64;
        check_bounds(global, data.len(), self.file_size)?;

        let chunk_size = self.chunk_size;
        let index = self.chunk_to_window(seq);
        let window = self.window(index)?;
        let offset = (seq - window.first_seq) as usize * chunk_size;
        let end = offset + data.len();
        if end > window.map.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk {seq} overruns window {index}"),
            ));
        }
        window.map[offset..end].copy_from_slice(data);
        window.dirty = true;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        for window in self.windows.values_mut() {
            if window.dirty {
                window.map.flush()?;
                window.dirty = false;
            }
        }
        self.windows.clear();
        self.file.sync_all()
    }

    fn kind(&self) -> &'static str {
        "windowed"
    }
}

fn check_bounds(offset: u64, len: usize, file_size: u64) -> io::Result<()> {
    if offset + len as u64 > file_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("write of {len} bytes at {offset} exceeds file size {file_size}"),
        ));
    }
    Ok(())
}

/// Create (or truncate) `path`, size it to exactly `file_size`, and pick the
/// sink that suits that size.
pub fn open_file_sink(
    path: &Path,
    file_size: u64,
    chunk_size: usize,
    settings: &FileTransferSettings,
) -> io::Result<Box<dyn ChunkSink>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(file_size)?;

    if file_size > 0 && file_size >= settings.windowed_threshold_bytes {
        Ok(Box::new(WindowedFileSink::new(
            file,
            file_size,
            chunk_size,
            settings.chunks_per_window,
            settings.max_windows,
        )))
    } else {
        Ok(Box::new(DirectFileSink::new(file, file_size, chunk_size)))
    }
}
