use crate::api::PipelineApi;
use crate::cancel::{StaleGuard, TaskToken};
use crate::dto::{Blob, SessionId};
use crate::error::ApiError;
use base64::{Engine as _, engine::general_purpose};
use log::debug;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Revocable reference to image bytes held by a [`PreviewRegistry`].
///
/// Cloning copies the reference, not the data. Once revoked the handle
/// no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewHandle {
    id: u64,
    url: String,
    pub mime_type: String,
    pub byte_len: usize,
    pub dimensions: Option<(u32, u32)>,
}

impl PreviewHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug)]
struct Entry {
    bytes: Arc<[u8]>,
    mime_type: String,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Entry>>,
}

/// Owner of every live preview's bytes, addressed by `blob:` style URLs.
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    inner: Arc<RegistryInner>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, bytes: impl Into<Arc<[u8]>>, mime_type: Option<&str>) -> PreviewHandle {
        let bytes = bytes.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mime_type = mime_type
            .filter(|mime| !mime.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| sniff_mime(&bytes));
        let handle = PreviewHandle {
            id,
            url: format!("blob:citoscan/{id}"),
            mime_type: mime_type.clone(),
            byte_len: bytes.len(),
            dimensions: read_dimensions(&bytes),
        };
        self.live().insert(id, Entry { bytes, mime_type });
        debug!("preview: created {}", handle.url);
        handle
    }

    pub fn create_from_blob(&self, blob: Blob) -> PreviewHandle {
        let Blob {
            bytes,
            content_type,
        } = blob;
        self.create(bytes, content_type.as_deref())
    }

    /// Frees the bytes behind `handle`. Returns false when it was already revoked.
    pub fn revoke(&self, handle: &PreviewHandle) -> bool {
        let removed = self.live().remove(&handle.id).is_some();
        if removed {
            debug!("preview: revoked {}", handle.url);
        }
        removed
    }

    pub fn resolve(&self, handle: &PreviewHandle) -> Option<Arc<[u8]>> {
        self.live()
            .get(&handle.id)
            .map(|entry| Arc::clone(&entry.bytes))
    }

    pub fn data_url(&self, handle: &PreviewHandle) -> Option<String> {
        let live = self.live();
        let entry = live.get(&handle.id)?;
        let encoded = general_purpose::STANDARD.encode(&entry.bytes);
        Some(format!("data:{};base64,{encoded}", entry.mime_type))
    }

    pub fn is_live(&self, handle: &PreviewHandle) -> bool {
        self.live().contains_key(&handle.id)
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sniff_mime(bytes: &[u8]) -> String {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}

fn read_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Holds at most one preview handle; replacing or dropping releases the old one.
#[derive(Debug)]
pub struct PreviewSlot {
    registry: PreviewRegistry,
    current: Mutex<Option<PreviewHandle>>,
}

impl PreviewSlot {
    pub fn new(registry: PreviewRegistry) -> Self {
        Self {
            registry,
            current: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PreviewRegistry {
        &self.registry
    }

    pub fn set(&self, handle: PreviewHandle) {
        let previous = self.slot().replace(handle);
        if let Some(previous) = previous {
            self.registry.revoke(&previous);
        }
    }

    /// Registers `blob` and makes it the current handle.
    pub fn set_blob(&self, blob: Blob) -> PreviewHandle {
        let handle = self.registry.create_from_blob(blob);
        self.set(handle.clone());
        handle
    }

    pub fn release(&self) {
        let previous = self.slot().take();
        if let Some(previous) = previous {
            self.registry.revoke(&previous);
        }
    }

    pub fn current(&self) -> Option<PreviewHandle> {
        self.slot().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<PreviewHandle>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PreviewSlot {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PatchKey {
    session: SessionId,
    rel_path: String,
}

#[derive(Debug, Default)]
struct PatchState {
    key: Option<PatchKey>,
    error: Option<ApiError>,
}

/// Thumbnail for one patch, keyed by session and relative path.
///
/// Changing the key releases the previous thumbnail before the new one is
/// requested; a response that arrives after its key changed is dropped.
pub struct PatchPreview {
    api: Arc<dyn PipelineApi>,
    slot: PreviewSlot,
    guard: StaleGuard,
    state: Mutex<PatchState>,
}

impl PatchPreview {
    pub fn new(api: Arc<dyn PipelineApi>, registry: PreviewRegistry) -> Self {
        Self {
            api,
            slot: PreviewSlot::new(registry),
            guard: StaleGuard::new(),
            state: Mutex::new(PatchState::default()),
        }
    }

    /// Shows the patch at `rel_path`; `Ok(None)` means the request was superseded.
    pub async fn show(
        &self,
        session: &SessionId,
        rel_path: &str,
    ) -> Result<Option<PreviewHandle>, ApiError> {
        let key = PatchKey {
            session: session.clone(),
            rel_path: rel_path.to_string(),
        };

        let token = {
            let mut state = self.state();
            if state.key.as_ref() == Some(&key)
                && let Some(handle) = self.slot.current()
            {
                return Ok(Some(handle));
            }
            state.key = Some(key);
            state.error = None;
            self.slot.release();
            self.guard.advance()
        };

        let fetched = self.api.patch(session, rel_path).await;
        self.apply(token, fetched)
    }

    fn apply(
        &self,
        token: TaskToken,
        fetched: Result<Blob, ApiError>,
    ) -> Result<Option<PreviewHandle>, ApiError> {
        let mut state = self.state();
        if token.is_stale() {
            debug!("patch preview: discarding stale response");
            return Ok(None);
        }
        match fetched {
            Ok(blob) => Ok(Some(self.slot.set_blob(blob))),
            Err(err) => {
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Releases the thumbnail and abandons any request in flight.
    pub fn hide(&self) {
        let mut state = self.state();
        self.guard.advance();
        state.key = None;
        state.error = None;
        self.slot.release();
    }

    pub fn current(&self) -> Option<PreviewHandle> {
        self.slot.current()
    }

    pub fn error(&self) -> Option<ApiError> {
        self.state().error.clone()
    }

    fn state(&self) -> MutexGuard<'_, PatchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PatchPreview {
    fn drop(&mut self) {
        self.guard.advance();
    }
}
