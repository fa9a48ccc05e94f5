// File storage used by the transfer engine.
//
// Read requests load the whole file up front so a session can be segmented once. Write requests
// are checked when they arrive, and the reassembled file is written in one go after the terminal
// block has been acknowledged.

use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};

/// Where files are read from and written to.
#[allow(async_fn_in_trait)]
pub trait FileStore {
    /// Loads the named file completely into memory.
    async fn read_whole_file(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Fails if a write of `name` would not be accepted.
    async fn check_writable(&self, name: &str) -> io::Result<()>;

    /// Stores `bytes` under `name`. Never overwrites an existing file.
    async fn write_whole_file(&self, name: &str, bytes: &[u8]) -> io::Result<()>;
}

/// Serves files out of a single directory on disk.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    read_only: bool,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> DiskStore {
        DiskStore { root: root.into(), read_only }
    }

    /// Maps a requested file name to a path under the root, refusing names that would escape it.
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.strip_prefix('/').unwrap_or(name));
        if relative.as_os_str().is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty file name"));
        }
        if !relative.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{name}' points outside of the served directory"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for DiskStore {
    async fn read_whole_file(&self, name: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(name)?;
        log::debug!("Reading {:#?}", path);
        fs::read(path).await
    }

    async fn check_writable(&self, name: &str) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "server is read-only"));
        }

        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(_) => return Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("{:#?} exists", path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let parent = path.parent().unwrap_or(self.root.as_path());
        if !fs::metadata(parent).await?.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{:#?} is not a directory", parent)));
        }
        Ok(())
    }

    async fn write_whole_file(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "server is read-only"));
        }

        let path = self.resolve(name)?;
        log::info!("Writing {} bytes to {:#?}", bytes.len(), path);
        let mut f = fs::OpenOptions::new().write(true).create_new(true).open(path).await?;
        f.write_all(bytes).await?;
        f.flush().await
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryStore;
