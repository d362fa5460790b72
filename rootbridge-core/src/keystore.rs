//! Key Store: an ordered set of `(kid, publicKey)` pairs persisted as a JSON
//! file, trusted-on-first-use and pinned thereafter.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::*;

use crate::crypto::Jwk;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredIdentity {
    kid: String,
    jwk: Jwk,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyStoreFile {
    #[serde(default)]
    identities: Vec<StoredIdentity>,
}

/// Guards the approved-identities file. Readers dominate (every auth attempt
/// looks one up); writes only happen on the approval path.
pub struct KeyStore {
    path: PathBuf,
    inner: RwLock<KeyStoreFile>,
}

impl KeyStore {
    pub async fn load(path: &Path) -> Result<Self> {
        let inner = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| BridgeError::KeyStore(format!("corrupt key store: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KeyStoreFile::default(),
            Err(e) => return Err(BridgeError::Io(e)),
        };
        Ok(Self {
            path: path.to_owned(),
            inner: RwLock::new(inner),
        })
    }

    pub async fn lookup(&self, kid: &str) -> Option<Jwk> {
        self.inner
            .read()
            .await
            .identities
            .iter()
            .find(|i| i.kid == kid)
            .map(|i| i.jwk.clone())
    }

    pub async fn contains(&self, kid: &str) -> bool {
        self.inner.read().await.identities.iter().any(|i| i.kid == kid)
    }

    /// Idempotent: inserting an already-known kid is a no-op and never
    /// overwrites the pinned public key. A mismatched public key under a
    /// known kid must be rejected by the caller checking `lookup` before
    /// calling `insert`, not by silently replacing here.
    pub async fn insert(&self, kid: String, jwk: Jwk) -> Result<()> {
        let mut guard = self.inner.write().await;
        if guard.identities.iter().any(|i| i.kid == kid) {
            return Ok(());
        }
        guard.identities.push(StoredIdentity { kid: kid.clone(), jwk });
        self.flush(&guard).await?;
        info!(%kid, "approved and pinned new client identity");
        Ok(())
    }

    async fn flush(&self, file: &KeyStoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(file)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
