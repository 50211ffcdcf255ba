use anyhow::{Context, Result};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Source of the bearer credential attached to backend requests.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentials {
    token: Mutex<Option<String>>,
}

impl MemoryCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }
}

impl CredentialStore for MemoryCredentials {
    fn get(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, token: &str) -> Result<()> {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

/// Token persisted in a single file; the file holds nothing but the token.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

}

impl CredentialStore for FileCredentials {
    fn get(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let token = raw.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }

    fn set(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create credential directory {}",
                    parent.display()
                )
            })?;
        }
        std::fs::write(&self.path, token.trim())
            .with_context(|| format!("failed to write token file {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove token file {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialStore, FileCredentials, MemoryCredentials};
    use tempfile::tempdir;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryCredentials::default();
        assert_eq!(store.get(), None);
        store.set("abc").expect("set");
        assert_eq!(store.get().as_deref(), Some("abc"));
        store.clear().expect("clear");
        assert_eq!(store.get(), None);
    }

    #[test]
    fn file_store_persists_and_clears() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("token");
        let store = FileCredentials::new(&path);

        assert_eq!(store.get(), None);
        store.set("  jwt-token\n").expect("set");
        assert_eq!(
            std::fs::read_to_string(&path).expect("token file"),
            "jwt-token"
        );
        assert_eq!(FileCredentials::new(&path).get().as_deref(), Some("jwt-token"));

        store.clear().expect("clear");
        assert!(!path.exists());
        store.clear().expect("clearing twice is fine");
    }
}
