//! Agent-side identity cache
//!
//! Remembers `{identity, code, key}` between runs so a restarted agent skips
//! registration. Without a path the cache lives only as long as the process.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ChannelError, Result};
use crate::protocol::handshake::ClientCredentials;

#[derive(Debug)]
pub struct IdentityCache {
    path: Option<PathBuf>,
    current: Mutex<Option<ClientCredentials>>,
}

impl IdentityCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    /// Read `path`. A missing or unreadable file yields an empty cache.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ClientCredentials>(&bytes) {
                Ok(creds) => {
                    debug!(identity = %creds.identity, "Loaded cached identity");
                    Some(creds)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt identity cache");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read identity cache");
                None
            }
        };
        Self {
            path: Some(path),
            current: Mutex::new(current),
        }
    }

    pub async fn from_config(config: &ClientConfig) -> Self {
        match &config.identity_cache_path {
            Some(path) => Self::load(path).await,
            None => Self::in_memory(),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<ClientCredentials>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<ClientCredentials> {
        self.current().clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the cached credentials and persist them
    pub async fn save(&self, creds: &ClientCredentials) -> Result<()> {
        *self.current() = Some(creds.clone());
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(creds)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ChannelError::Persistence(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ChannelError::Persistence(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Forget the cached credentials
    pub async fn clear(&self) -> Result<()> {
        *self.current() = None;
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ChannelError::Persistence(format!(
                        "{}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn creds() -> ClientCredentials {
        ClientCredentials {
            identity: "id-1".into(),
            code: "001".into(),
            key: Some("00112233445566778899aabbccddeeff".into()),
        }
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_identity.json");

        let cache = IdentityCache::load(&path).await;
        assert!(cache.get().is_none());
        cache.save(&creds()).await.unwrap();

        let reloaded = IdentityCache::load(&path).await;
        assert_eq!(reloaded.get(), Some(creds()));

        reloaded.clear().await.unwrap();
        assert!(!path.exists());
        assert!(IdentityCache::load(&path).await.get().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_identity.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(IdentityCache::load(&path).await.get().is_none());
    }
}
