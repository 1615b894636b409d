//! Shared helpers for session tests

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use fuse_bridge::backend::memory::MemoryBackend;
use fuse_bridge::config::Config;
use fuse_bridge::path::CacheKey;
use fuse_bridge::session::Session;

pub type TestSession = Session<MemoryBackend>;

/// Chunk size used by `write_file`, roughly what the kernel sends
pub const WRITE_CHUNK: usize = 4096;

pub fn key(path: &str) -> CacheKey {
    CacheKey::new(path)
}

/// Session over a fresh forward-only memory backend
pub fn session() -> Arc<TestSession> {
    Arc::new(Session::new(Arc::new(MemoryBackend::new())))
}

/// Session over `backend` configured from a YAML snippet
pub fn session_with(backend: MemoryBackend, yaml: &str) -> Result<Arc<TestSession>> {
    let config: Config = yaml.parse()?;
    Ok(Arc::new(Session::from_config(Arc::new(backend), &config)))
}

/// Create or replace a file the way a sequential `cp` would
pub async fn write_file(session: &TestSession, path: &str, data: &[u8]) -> Result<()> {
    let fh = session.open_write(&key(path)).await?;
    let mut offset = 0u64;
    for chunk in data.chunks(WRITE_CHUNK) {
        let n = session.write(fh, offset, chunk).await?;
        offset += n as u64;
    }
    session.release(fh).await?;
    Ok(())
}

/// Read a whole file with sequential reads
pub async fn read_file(session: &TestSession, path: &str) -> Result<Vec<u8>> {
    let fh = session.open_read(&key(path)).await?;
    let mut data = Vec::new();
    loop {
        let chunk = session.read(fh, data.len() as u64, 4096).await?;
        if chunk.is_empty() {
            break;
        }
        data.extend_from_slice(&chunk);
    }
    session.release(fh).await?;
    Ok(data)
}

/// Deterministic test payload
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
