use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::chunk::ChunkInfo;
use crate::common::ChunkId;
use crate::error::{GfsError, Result};

/// On-disk chunk replicas: one file per chunk, named `ch{id}`. A sealed chunk
/// also has an empty `ch{id}.full` marker next to it.
pub struct ChunkserverStorage {
    // The path to the chunkserver storage directory.
    storage_dir: PathBuf,
    chunk_size: u64,
    chunks: HashMap<ChunkId, ChunkInfo>,
}

fn parse_chunk_name(name: &str) -> Option<ChunkId> {
    name.strip_prefix("ch")?.parse::<u64>().ok()
}

impl ChunkserverStorage {
    /// Open the storage directory, creating it if needed, and rebuild the
    /// checksum of every chunk found in it.
    pub fn open(storage_dir: impl Into<PathBuf>, chunk_size: u64) -> Result<ChunkserverStorage> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;

        let mut chunks = HashMap::new();
        for entry in std::fs::read_dir(&storage_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(chunk_id) = name.to_str().and_then(parse_chunk_name) else {
                continue;
            };

            let data = std::fs::read(entry.path())?;
            if data.len() as u64 > chunk_size {
                tracing::warn!(chunk = chunk_id, len = data.len(), "chunk larger than chunk size, skipping");
                continue;
            }
            let checksum = crc32fast::hash(&data);
            let full = storage_dir.join(format!("ch{chunk_id}.full")).exists();
            tracing::debug!(chunk = chunk_id, checksum, used = data.len(), full, "loaded chunk");
            chunks.insert(chunk_id, ChunkInfo { id: chunk_id, checksum, used: data.len() as u64, full });
        }

        tracing::info!(dir = %storage_dir.display(), chunks = chunks.len(), "chunk storage opened");
        Ok(ChunkserverStorage { storage_dir, chunk_size, chunks })
    }

    fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.storage_dir.join(format!("ch{chunk_id}"))
    }

    fn seal_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.storage_dir.join(format!("ch{chunk_id}.full"))
    }

    /// Format an empty chunk. Formatting a chunk that already exists is a no-op.
    pub fn create_chunk(&mut self, chunk_id: ChunkId) -> Result<()> {
        if self.chunks.contains_key(&chunk_id) {
            return Ok(());
        }
        OpenOptions::new().create(true).truncate(false).write(true).open(self.chunk_path(chunk_id))?;
        let checksum = crc32fast::hash(&[]);
        self.chunks.insert(chunk_id, ChunkInfo { id: chunk_id, checksum, used: 0, full: false });
        Ok(())
    }

    /// Write `data` at `offset`, extending the chunk (zero filled) if needed.
    /// Returns the new used length.
    pub fn write_at(&mut self, chunk_id: ChunkId, offset: u64, data: &[u8]) -> Result<u64> {
        if !self.chunks.contains_key(&chunk_id) {
            return Err(GfsError::NoSuchChunk(chunk_id));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.filter(|end| *end <= self.chunk_size).is_none() {
            return Err(GfsError::ChunkFull { chunk: chunk_id });
        }

        let path = self.chunk_path(chunk_id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;

        // Whole-chunk checksum over the bytes now on disk.
        file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let info = self.chunks.get_mut(&chunk_id).ok_or(GfsError::NoSuchChunk(chunk_id))?;
        info.used = contents.len() as u64;
        info.checksum = crc32fast::hash(&contents);
        Ok(info.used)
    }

    /// Read up to `len` bytes at `offset`, clipped to the used length.
    pub fn read(&self, chunk_id: ChunkId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let info = self.chunks.get(&chunk_id).ok_or(GfsError::NoSuchChunk(chunk_id))?;
        if offset > info.used {
            return Err(GfsError::ReadErr(format!(
                "offset {offset} beyond end of chunk {chunk_id} ({} bytes)",
                info.used
            )));
        }
        let len = std::cmp::min(len, info.used - offset);

        let mut file = std::fs::File::open(self.chunk_path(chunk_id))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn info(&self, chunk_id: ChunkId) -> Option<&ChunkInfo> {
        self.chunks.get(&chunk_id)
    }

    /// Seal a chunk against further mutations. The seal is written to disk
    /// before it takes effect, so it survives a restart.
    pub fn mark_full(&mut self, chunk_id: ChunkId) -> Result<()> {
        let path = self.seal_path(chunk_id);
        let info = self.chunks.get_mut(&chunk_id).ok_or(GfsError::NoSuchChunk(chunk_id))?;
        if !info.full {
            std::fs::write(path, [])?;
            info.full = true;
        }
        Ok(())
    }

    /// Forget a chunk whose file can no longer be trusted.
    pub fn drop_chunk(&mut self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        self.chunks.remove(&chunk_id)
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.chunks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
