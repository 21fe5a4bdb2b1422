use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::scp::{CopyDirective, FileReader, Parameters, SinkHandler, Status, TransferContext};
use crate::ssh::SessionInfo;

const CHUNK_SIZE: usize = 64 * 1024; // 64 KB chunks

/// A file written by [`DirectorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub length: u64,
    pub sha256: String,
}

/// Stores uploads below a root directory
pub struct DirectorySink {
    root: PathBuf,
    max_file_size: Option<u64>,
    received: Mutex<Vec<ReceivedFile>>,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: None,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Refuse files announced larger than `limit` bytes
    pub fn with_max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = Some(limit);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files completed so far, in arrival order
    pub fn received(&self) -> Vec<ReceivedFile> {
        self.lock_received().clone()
    }

    fn lock_received(&self) -> MutexGuard<'_, Vec<ReceivedFile>> {
        self.received.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Map a client pattern onto the root; None if it would leave it
    fn resolve(&self, pattern: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(pattern).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }

    /// Where the file announced by `file` ends up
    fn target(&self, transfer: &TransferContext, file: &CopyDirective) -> Option<PathBuf> {
        let base = self.resolve(&transfer.pattern)?;
        if transfer.parameters.contains(Parameters::DIRECTORY) || base.is_dir() {
            Some(base.join(&file.filename))
        } else {
            Some(base)
        }
    }

    async fn write_file(
        &self,
        path: &Path,
        file: &CopyDirective,
        reader: &mut FileReader<'_>,
    ) -> Result<ReceivedFile> {
        let mut out = File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n]).await?;
            hasher.update(&buffer[..n]);
            written += n as u64;
        }
        out.sync_all().await?;

        if written != file.length {
            return Err(anyhow!(
                "Short read: got {} of {} bytes",
                written,
                file.length
            ));
        }
        set_mode(path, file.mode).await?;

        Ok(ReceivedFile {
            path: path.to_path_buf(),
            length: written,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[async_trait]
impl SinkHandler for DirectorySink {
    async fn sink_request(&self, session: &SessionInfo, parameters: Parameters, pattern: &str) -> bool {
        if parameters.contains(Parameters::RECURSIVE) {
            warn!("[{}] Recursive upload refused", session.remote_addr);
            return false;
        }
        let Some(base) = self.resolve(pattern) else {
            warn!("[{}] Pattern {} escapes the upload root", session.remote_addr, pattern);
            return false;
        };
        if parameters.contains(Parameters::DIRECTORY) && !base.is_dir() {
            warn!("[{}] Target directory {} does not exist", session.remote_addr, pattern);
            return false;
        }
        info!("[{}] {} uploading to {}", session.remote_addr, session.user, base.display());
        true
    }

    async fn file_request(&self, _transfer: &TransferContext, file: &CopyDirective) -> Status {
        if !is_safe_filename(&file.filename) {
            return Status::warning(format!("invalid filename {:?}", file.filename));
        }
        match self.max_file_size {
            Some(limit) if file.length > limit => {
                Status::fatal(format!("{} exceeds the {} byte limit", file.filename, limit))
            }
            _ => Status::ok(),
        }
    }

    async fn file_copy(
        &self,
        transfer: &TransferContext,
        file: &CopyDirective,
        reader: &mut FileReader<'_>,
    ) -> Status {
        let Some(path) = self.target(transfer, file) else {
            return Status::fatal("invalid target");
        };

        match self.write_file(&path, file, reader).await {
            Ok(received) => {
                info!(
                    "[{}] Stored {} ({} bytes, sha256 {})",
                    transfer.session.remote_addr,
                    received.path.display(),
                    received.length,
                    received.sha256
                );
                self.lock_received().push(received);
                Status::ok()
            }
            Err(e) => {
                warn!("[{}] Failed to store {}: {:#}", transfer.session.remote_addr, path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                Status::fatal(e.to_string())
            }
        }
    }
}

fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode & 0o7777);
    tokio::fs::set_permissions(path, permissions)
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
