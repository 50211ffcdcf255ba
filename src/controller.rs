use crate::api::PipelineApi;
use crate::cancel::{StaleGuard, TaskToken};
use crate::candidate::{FileKind, UploadCandidate};
use crate::dto::{AnalysisSession, Blob, ResultSet, SessionId, SessionStatus};
use crate::error::ApiError;
use crate::preview::{PreviewHandle, PreviewRegistry, PreviewSlot};
use crate::projection::{Marker, project_markers};
use crate::scheduler::{PollOutcome, PollSchedule, PollingScheduler};
use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const PREVIEW_ID_MISSING_MESSAGE: &str = "The preview session id was not returned.";
const SESSION_ID_MISSING_MESSAGE: &str = "The session id was not returned.";
const SESSION_FAILED_MESSAGE: &str = "The analysis failed on the server.";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    FileAccepted { name: String, kind: FileKind },
    FileRejected { message: String },
    PreviewReady { url: String },
    PreviewFailed { message: String },
    AnalysisStarted { id: SessionId, status: SessionStatus },
    StatusChanged { id: SessionId, status: SessionStatus },
    ResultsReady { id: SessionId, patches: usize },
    /// Polling stopped on a request failure.
    PollFailed { message: String },
    /// The session reached a terminal status and hydration, if any, is over.
    AnalysisFinished { id: SessionId, status: SessionStatus },
    Cleared,
}

#[derive(Debug, Default)]
struct SessionState {
    candidate: Option<UploadCandidate>,
    kind: Option<FileKind>,
    error: Option<ApiError>,
    loading_preview: bool,
    uploading: bool,
    session_id: Option<SessionId>,
    status: Option<SessionStatus>,
    session: Option<AnalysisSession>,
    results: Option<ResultSet>,
}

impl SessionState {
    fn is_busy(&self) -> bool {
        self.uploading || self.status.is_some_and(SessionStatus::is_in_progress)
    }

    fn can_analyze(&self) -> bool {
        self.candidate.is_some() && self.error.is_none() && !self.loading_preview && !self.is_busy()
    }

    fn reset_session(&mut self) {
        self.session_id = None;
        self.status = None;
        self.session = None;
        self.results = None;
    }
}

/// Point-in-time copy of the controller state for rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub file_name: Option<String>,
    pub kind: Option<FileKind>,
    pub error: Option<ApiError>,
    pub loading_preview: bool,
    pub uploading: bool,
    pub session_id: Option<SessionId>,
    pub status: Option<SessionStatus>,
    pub session: Option<AnalysisSession>,
    pub results: Option<ResultSet>,
    pub preview: Option<PreviewHandle>,
}

impl SessionSnapshot {
    pub fn is_busy(&self) -> bool {
        self.uploading || self.status.is_some_and(SessionStatus::is_in_progress)
    }

    pub fn can_analyze(&self) -> bool {
        self.file_name.is_some() && self.error.is_none() && !self.loading_preview && !self.is_busy()
    }

    pub fn has_results(&self) -> bool {
        self.status == Some(SessionStatus::Done) && self.results.is_some()
    }
}

enum PollStep {
    Continue,
    Stop,
    Hydrate,
}

struct Inner {
    api: Arc<dyn PipelineApi>,
    file_preview: PreviewSlot,
    scheduler: PollingScheduler,
    guard: StaleGuard,
    state: Mutex<SessionState>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// Drives one upload from file selection through polling to hydrated results.
///
/// Clones share the same session. Dropping the last clone stops polling and
/// releases the held preview.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        registry: PreviewRegistry,
        schedule: PollSchedule,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Self> {
        let scheduler = PollingScheduler::new(schedule).map_err(anyhow::Error::msg)?;
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                file_preview: PreviewSlot::new(registry),
                scheduler,
                guard: StaleGuard::new(),
                state: Mutex::new(SessionState::default()),
                events,
            }),
        })
    }

    /// Validates `candidate` and makes it the current file, discarding any
    /// previous file, session and preview. Whole-slide files get a
    /// server-rendered preview; image files are previewed from their bytes.
    pub async fn select_file(&self, candidate: UploadCandidate) -> Result<FileKind, ApiError> {
        let inner = &self.inner;
        let (token, kind) = {
            let mut state = inner.state();
            let token = inner.guard.advance();
            inner.scheduler.stop();
            inner.file_preview.release();
            state.reset_session();
            state.uploading = false;

            match candidate.validate() {
                Err(err) => {
                    debug!("controller: rejected {}: {err}", candidate.name);
                    state.candidate = None;
                    state.kind = None;
                    state.loading_preview = false;
                    state.error = Some(err.clone());
                    inner.emit(SessionEvent::FileRejected {
                        message: err.message.clone(),
                    });
                    return Err(err);
                }
                Ok(kind) => {
                    state.candidate = Some(candidate.clone());
                    state.kind = Some(kind);
                    state.error = None;
                    state.loading_preview = kind == FileKind::WholeSlide;
                    inner.emit(SessionEvent::FileAccepted {
                        name: candidate.name.clone(),
                        kind,
                    });
                    (token, kind)
                }
            }
        };

        match kind {
            FileKind::Image => inner.preview_locally(&token, &candidate).await?,
            FileKind::WholeSlide => inner.preview_on_server(&token, &candidate).await?,
        }
        Ok(kind)
    }

    /// Starts analysis of the current file. Returns `Ok(false)` without doing
    /// anything when [`can_analyze`](Self::can_analyze) is false.
    pub async fn start_analysis(&self) -> Result<bool, ApiError> {
        let inner = &self.inner;
        let (token, candidate, existing) = {
            let mut state = inner.state();
            if !state.can_analyze() {
                debug!("controller: analysis not allowed in current state");
                return Ok(false);
            }
            let Some(candidate) = state.candidate.clone() else {
                return Ok(false);
            };
            state.uploading = true;
            state.error = None;
            state.status = None;
            state.results = None;
            let existing = match state.kind {
                Some(FileKind::WholeSlide) => state.session_id.clone(),
                _ => None,
            };
            (inner.guard.token(), candidate, existing)
        };

        let started = match &existing {
            Some(id) => {
                info!("running preview session {id}");
                inner.api.run_session(id).await
            }
            None => {
                info!("creating analysis session for {}", candidate.name);
                inner.api.create_session(&candidate).await
            }
        };

        let mut state = inner.state();
        if token.is_stale() {
            debug!("controller: analysis start superseded");
            return Ok(false);
        }
        state.uploading = false;

        let session = match started {
            Ok(session) => session,
            Err(err) => {
                state.error = Some(err.clone());
                return Err(err);
            }
        };
        let Some(id) = session.identifier().cloned().or(existing) else {
            let err = ApiError::missing_session(SESSION_ID_MISSING_MESSAGE);
            state.error = Some(err.clone());
            return Err(err);
        };

        let status = session.status.unwrap_or(SessionStatus::Queued);
        state.session_id = Some(id.clone());
        state.status = Some(status);
        state.session = Some(session);
        inner.emit(SessionEvent::AnalysisStarted {
            id: id.clone(),
            status,
        });
        self.start_polling(id, token);
        Ok(true)
    }

    fn start_polling(&self, id: SessionId, epoch: TaskToken) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.start(move |ticket| {
            let weak = weak.clone();
            let id = id.clone();
            let epoch = epoch.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return PollOutcome::Stop;
                };
                inner.poll_once(&id, &epoch, &ticket).await
            }
        });
    }

    /// Releases the preview, stops polling and forgets the file, session,
    /// results and error. Safe to call at any time, repeatedly.
    pub fn clear(&self) {
        let inner = &self.inner;
        let mut state = inner.state();
        inner.guard.advance();
        inner.scheduler.stop();
        inner.file_preview.release();
        *state = SessionState::default();
        inner.emit(SessionEvent::Cleared);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state();
        SessionSnapshot {
            file_name: state.candidate.as_ref().map(|c| c.name.clone()),
            kind: state.kind,
            error: state.error.clone(),
            loading_preview: state.loading_preview,
            uploading: state.uploading,
            session_id: state.session_id.clone(),
            status: state.status,
            session: state.session.clone(),
            results: state.results.clone(),
            preview: self.inner.file_preview.current(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state().is_busy()
    }

    pub fn can_analyze(&self) -> bool {
        self.inner.state().can_analyze()
    }

    pub fn has_results(&self) -> bool {
        let state = self.inner.state();
        state.status == Some(SessionStatus::Done) && state.results.is_some()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.scheduler.is_active()
    }

    pub fn preview(&self) -> Option<PreviewHandle> {
        self.inner.file_preview.current()
    }

    pub fn registry(&self) -> &PreviewRegistry {
        self.inner.file_preview.registry()
    }

    /// Overlay markers for the current results, empty until results arrive.
    pub fn markers(&self, display_count: usize) -> Vec<Marker> {
        self.inner
            .state()
            .results
            .as_ref()
            .map(|results| project_markers(results, display_count))
            .unwrap_or_default()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn preview_locally(
        &self,
        token: &TaskToken,
        candidate: &UploadCandidate,
    ) -> Result<(), ApiError> {
        let read = candidate.read_bytes().await;
        let mut state = self.state();
        if token.is_stale() {
            return Ok(());
        }
        match read {
            Ok(bytes) => {
                let handle = self
                    .file_preview
                    .registry()
                    .create(bytes, Some(candidate.mime_type()));
                self.file_preview.set(handle.clone());
                self.emit(SessionEvent::PreviewReady {
                    url: handle.url().to_string(),
                });
                Ok(())
            }
            Err(err) => {
                let err = ApiError::validation(format!("Could not read {}: {err}", candidate.name));
                state.error = Some(err.clone());
                self.emit(SessionEvent::PreviewFailed {
                    message: err.message.clone(),
                });
                Err(err)
            }
        }
    }

    async fn preview_on_server(
        &self,
        token: &TaskToken,
        candidate: &UploadCandidate,
    ) -> Result<(), ApiError> {
        let created = self.api.create_preview_session(candidate).await;
        let id = {
            let mut state = self.state();
            if token.is_stale() {
                debug!("controller: dropping superseded preview session");
                return Ok(());
            }
            let outcome = created.and_then(|session| {
                let id = session
                    .identifier()
                    .cloned()
                    .ok_or_else(|| ApiError::missing_session(PREVIEW_ID_MISSING_MESSAGE))?;
                Ok((id, session))
            });
            match outcome {
                Ok((id, session)) => {
                    state.session_id = Some(id.clone());
                    state.status = Some(session.status.unwrap_or(SessionStatus::Uploaded));
                    state.session = Some(session);
                    id
                }
                Err(err) => return Err(self.fail_preview(&mut state, err)),
            }
        };

        let fetched = self.api.preview(&id).await;
        let mut state = self.state();
        if token.is_stale() {
            debug!("controller: dropping superseded preview image");
            return Ok(());
        }
        state.loading_preview = false;
        match fetched {
            Ok(blob) => {
                self.show_preview(blob);
                Ok(())
            }
            Err(err) => Err(self.fail_preview(&mut state, err)),
        }
    }

    fn show_preview(&self, blob: Blob) {
        let handle = self.file_preview.set_blob(blob);
        self.emit(SessionEvent::PreviewReady {
            url: handle.url().to_string(),
        });
    }

    fn fail_preview(&self, state: &mut SessionState, err: ApiError) -> ApiError {
        state.loading_preview = false;
        state.error = Some(err.clone());
        self.file_preview.release();
        self.emit(SessionEvent::PreviewFailed {
            message: err.message.clone(),
        });
        err
    }

    async fn poll_once(&self, id: &SessionId, epoch: &TaskToken, ticket: &TaskToken) -> PollOutcome {
        let observed = self.api.session(id).await;
        let step = {
            let mut state = self.state();
            if epoch.is_stale() || ticket.is_stale() {
                return PollOutcome::Stop;
            }
            match observed {
                Err(err) if err.is_transient_auth_race() => {
                    warn!("poll {id}: {err} with empty body, retrying");
                    PollStep::Continue
                }
                Err(err) => {
                    warn!("poll {id} failed: {err}");
                    state.error = Some(err.clone());
                    self.emit(SessionEvent::PollFailed {
                        message: err.message,
                    });
                    PollStep::Stop
                }
                Ok(session) => {
                    let status = session.status;
                    debug!("poll {id}: status {status:?}");
                    state.status = status;
                    state.session = Some(session);
                    if let Some(status) = status {
                        self.emit(SessionEvent::StatusChanged {
                            id: id.clone(),
                            status,
                        });
                    }
                    match status {
                        Some(SessionStatus::Done) => PollStep::Hydrate,
                        Some(SessionStatus::Error) => {
                            info!("session {id} ended in ERROR");
                            state.error = Some(ApiError::session_failed(SESSION_FAILED_MESSAGE));
                            self.emit(SessionEvent::AnalysisFinished {
                                id: id.clone(),
                                status: SessionStatus::Error,
                            });
                            PollStep::Stop
                        }
                        _ => PollStep::Continue,
                    }
                }
            }
        };

        match step {
            PollStep::Continue => PollOutcome::Continue,
            PollStep::Stop => PollOutcome::Stop,
            PollStep::Hydrate => {
                self.hydrate(id, epoch, ticket).await;
                PollOutcome::Stop
            }
        }
    }

    /// Fetches results and then the finalized preview for a DONE session.
    async fn hydrate(&self, id: &SessionId, epoch: &TaskToken, ticket: &TaskToken) {
        info!("session {id} is DONE, fetching results");
        let results = self.api.results(id).await;
        {
            let mut state = self.state();
            if epoch.is_stale() || ticket.is_stale() {
                return;
            }
            match results {
                Ok(results) => {
                    let patches = results.top_patches.len();
                    state.results = Some(results);
                    self.emit(SessionEvent::ResultsReady {
                        id: id.clone(),
                        patches,
                    });
                }
                Err(err) => {
                    warn!("results for {id} failed: {err}");
                    state.error = Some(err);
                }
            }
            state.loading_preview = true;
        }

        let fetched = self.api.preview(id).await;
        let mut state = self.state();
        if epoch.is_stale() || ticket.is_stale() {
            return;
        }
        state.loading_preview = false;
        match fetched {
            Ok(blob) => self.show_preview(blob),
            Err(err) => {
                warn!("finalized preview for {id} failed: {err}");
                if state.error.is_none() {
                    state.error = Some(err.clone());
                }
                self.file_preview.release();
                self.emit(SessionEvent::PreviewFailed {
                    message: err.message,
                });
            }
        }
        self.emit(SessionEvent::AnalysisFinished {
            id: id.clone(),
            status: SessionStatus::Done,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionController, SessionEvent};
    use crate::api::scripted::{Endpoint, ScriptedApi, png_blob, session};
    use crate::candidate::{CandidateSource, FileKind, UploadCandidate};
    use crate::dto::{AnalysisSession, Patch, ResultSet, SessionId, SessionStatus};
    use crate::error::{ApiError, ErrorKind};
    use crate::preview::PreviewRegistry;
    use crate::scheduler::PollSchedule;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn controller(
        api: &Arc<ScriptedApi>,
    ) -> (
        SessionController,
        PreviewRegistry,
        UnboundedReceiver<SessionEvent>,
    ) {
        let registry = PreviewRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = SessionController::new(
            api.clone(),
            registry.clone(),
            PollSchedule::default(),
            Some(tx),
        )
        .expect("controller");
        (controller, registry, rx)
    }

    fn jpg(name: &str) -> UploadCandidate {
        UploadCandidate::in_memory(name, b"jpeg-bytes".to_vec())
    }

    fn slide(name: &str) -> UploadCandidate {
        UploadCandidate::in_memory(name, b"svs-bytes".to_vec())
    }

    fn results_with(count: usize) -> ResultSet {
        ResultSet {
            top_patches: (0..count)
                .map(|i| Patch {
                    rel_path: Some(format!("tiles/{i}.png")),
                    conf: 0.9,
                    norm_x: Some(0.25),
                    norm_y: Some(0.75),
                    ..Patch::default()
                })
                .collect(),
            ..ResultSet::default()
        }
    }

    async fn wait_for(
        rx: &mut UnboundedReceiver<SessionEvent>,
        want: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = rx.recv().await.expect("event channel open");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event before timeout")
    }

    fn finished(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::AnalysisFinished { .. })
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected_without_network() {
        let api = ScriptedApi::new();
        let (controller, _registry, _rx) = controller(&api);

        let err = controller
            .select_file(UploadCandidate::in_memory("notes.txt", b"hello".to_vec()))
            .await
            .expect_err("txt rejected");
        assert_eq!(err.kind, ErrorKind::Validation);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.error, Some(err));
        assert!(snapshot.file_name.is_none());
        assert!(snapshot.preview.is_none());
        assert!(!snapshot.can_analyze());
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn oversized_slide_is_rejected() {
        let api = ScriptedApi::new();
        let (controller, _registry, _rx) = controller(&api);
        let huge = UploadCandidate {
            name: "huge.svs".to_string(),
            size: 6 * 1024 * 1024 * 1024,
            source: CandidateSource::Memory(Vec::<u8>::new().into()),
        };

        let err = controller.select_file(huge).await.expect_err("too large");
        assert!(err.message.contains("exceeds maximum size"));
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn rejection_discards_previous_file_and_preview() {
        let api = ScriptedApi::new();
        let (controller, registry, _rx) = controller(&api);

        controller.select_file(jpg("a.jpg")).await.expect("jpg");
        assert_eq!(registry.live_count(), 1);

        controller
            .select_file(UploadCandidate::in_memory("b.gif", b"gif".to_vec()))
            .await
            .expect_err("gif rejected");
        let snapshot = controller.snapshot();
        assert!(snapshot.file_name.is_none());
        assert!(snapshot.preview.is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn image_files_preview_locally() {
        let api = ScriptedApi::new();
        let (controller, registry, _rx) = controller(&api);

        let kind = controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        assert_eq!(kind, FileKind::Image);

        let snapshot = controller.snapshot();
        let preview = snapshot.preview.clone().expect("local preview");
        assert_eq!(preview.mime_type, "image/jpeg");
        assert_eq!(
            registry.resolve(&preview).as_deref(),
            Some(&b"jpeg-bytes"[..])
        );
        assert!(snapshot.session_id.is_none());
        assert!(snapshot.can_analyze());
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn whole_slide_gets_server_preview() {
        let api = ScriptedApi::new();
        api.push_session(
            Endpoint::CreatePreview,
            Ok(AnalysisSession {
                id: Some(SessionId::new("11")),
                ..AnalysisSession::default()
            }),
        );
        api.push_blob(Endpoint::Preview, Ok(png_blob("slide")));
        let (controller, _registry, _rx) = controller(&api);

        let kind = controller.select_file(slide("case.svs")).await.expect("svs");
        assert_eq!(kind, FileKind::WholeSlide);
        assert_eq!(
            api.calls_with_args(Endpoint::CreatePreview),
            vec![Some("case.svs".to_string())]
        );
        assert_eq!(api.count(Endpoint::Create), 0);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.session_id, Some(SessionId::new("11")));
        assert_eq!(snapshot.status, Some(SessionStatus::Uploaded));
        assert!(!snapshot.loading_preview);
        assert_eq!(snapshot.preview.expect("preview").byte_len, "slide".len());
        assert_eq!(
            api.calls_with_args(Endpoint::Preview),
            vec![Some("11".to_string())]
        );
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn whole_slide_preview_failures_leave_no_preview() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::CreatePreview, Err(ApiError::http(500, "boom")));
        let (controller, registry, _rx) = controller(&api);

        let err = controller
            .select_file(slide("case.svs"))
            .await
            .expect_err("create failed");
        assert_eq!(err.message, "boom");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.error, Some(err));
        assert!(snapshot.preview.is_none());
        assert!(!snapshot.loading_preview);
        assert_eq!(api.count(Endpoint::Preview), 0);

        api.push_session(
            Endpoint::CreatePreview,
            Ok(session("12", SessionStatus::Uploaded)),
        );
        api.push_blob(Endpoint::Preview, Err(ApiError::http(404, "no preview")));
        controller
            .select_file(slide("case.svs"))
            .await
            .expect_err("preview failed");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.session_id, Some(SessionId::new("12")));
        assert!(snapshot.preview.is_none());
        assert_eq!(registry.live_count(), 0);
        assert!(!snapshot.can_analyze());
    }

    #[tokio::test]
    async fn preview_session_without_id_is_an_error() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::CreatePreview, Ok(AnalysisSession::default()));
        let (controller, _registry, _rx) = controller(&api);

        let err = controller
            .select_file(slide("case.svs"))
            .await
            .expect_err("missing id");
        assert_eq!(err.kind, ErrorKind::MissingSession);
        assert_eq!(api.count(Endpoint::Preview), 0);
    }

    #[tokio::test]
    async fn clear_during_slide_preview_discards_late_response() {
        let api = ScriptedApi::new();
        api.push_session(
            Endpoint::CreatePreview,
            Ok(session("7", SessionStatus::Uploaded)),
        );
        let gate = api.gate(Endpoint::CreatePreview);
        let (controller, registry, _rx) = controller(&api);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.select_file(slide("late.svs")).await })
        };
        gate.wait_entered().await;
        assert!(controller.snapshot().loading_preview);
        controller.clear();
        gate.release();

        pending.await.expect("join").expect("superseded, not failed");
        let snapshot = controller.snapshot();
        assert!(snapshot.file_name.is_none());
        assert!(snapshot.session_id.is_none());
        assert!(snapshot.preview.is_none());
        assert!(!snapshot.loading_preview);
        assert_eq!(api.count(Endpoint::Preview), 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn new_selection_supersedes_pending_slide_preview() {
        let api = ScriptedApi::new();
        api.push_session(
            Endpoint::CreatePreview,
            Ok(session("8", SessionStatus::Uploaded)),
        );
        api.push_blob(Endpoint::Preview, Ok(png_blob("stale-slide")));
        let gate = api.gate(Endpoint::Preview);
        let (controller, registry, _rx) = controller(&api);

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.select_file(slide("first.svs")).await })
        };
        gate.wait_entered().await;
        controller.select_file(jpg("second.jpg")).await.expect("jpg");
        gate.release();
        pending.await.expect("join").expect("superseded, not failed");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.file_name.as_deref(), Some("second.jpg"));
        assert!(snapshot.session_id.is_none());
        assert_eq!(snapshot.preview.expect("preview").byte_len, "jpeg-bytes".len());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn clear_resets_everything_and_is_idempotent() {
        let api = ScriptedApi::new();
        let (controller, registry, mut rx) = controller(&api);
        controller.select_file(jpg("a.jpg")).await.expect("jpg");

        controller.clear();
        controller.clear();

        let snapshot = controller.snapshot();
        assert!(snapshot.file_name.is_none());
        assert!(snapshot.error.is_none());
        assert!(snapshot.preview.is_none());
        assert!(!snapshot.is_busy());
        assert_eq!(registry.live_count(), 0);
        wait_for(&mut rx, |event| *event == SessionEvent::Cleared).await;
    }

    #[tokio::test]
    async fn start_analysis_is_a_no_op_when_not_allowed() {
        let api = ScriptedApi::new();
        let (controller, _registry, _rx) = controller(&api);
        assert!(!controller.start_analysis().await.expect("no file"));

        controller
            .select_file(UploadCandidate::in_memory("bad.bmp", b"bmp".to_vec()))
            .await
            .expect_err("bmp rejected");
        assert!(!controller.start_analysis().await.expect("error present"));
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn image_analysis_polls_to_done_and_hydrates_once() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("21", SessionStatus::Queued)));
        api.push_session(Endpoint::Session, Ok(session("21", SessionStatus::Running)));
        api.push_session(Endpoint::Session, Ok(session("21", SessionStatus::Done)));
        api.push_results(Ok(results_with(3)));
        api.push_blob(Endpoint::Preview, Ok(png_blob("final")));
        let (controller, registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        assert!(controller.start_analysis().await.expect("started"));
        assert!(controller.is_busy());
        assert!(!controller.can_analyze());
        assert!(!controller.start_analysis().await.expect("busy"));

        let event = wait_for(&mut rx, finished).await;
        assert_eq!(
            event,
            SessionEvent::AnalysisFinished {
                id: SessionId::new("21"),
                status: SessionStatus::Done,
            }
        );
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(api.count(Endpoint::Create), 1);
        assert_eq!(api.count(Endpoint::Session), 2);
        assert_eq!(api.count(Endpoint::Results), 1);
        assert!(controller.has_results());
        assert!(!controller.is_busy());
        assert!(!controller.is_polling());
        assert_eq!(controller.markers(5).len(), 3);

        let snapshot = controller.snapshot();
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.preview.expect("final preview").byte_len, "final".len());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_stops_without_results() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("22", SessionStatus::Queued)));
        api.push_session(Endpoint::Session, Ok(session("22", SessionStatus::Running)));
        api.push_session(Endpoint::Session, Ok(session("22", SessionStatus::Error)));
        let (controller, _registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        wait_for(&mut rx, finished).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, Some(SessionStatus::Error));
        assert_eq!(
            snapshot.error.as_ref().map(|err| err.kind),
            Some(ErrorKind::SessionFailed)
        );
        assert!(!snapshot.has_results());
        assert_eq!(api.count(Endpoint::Results), 0);
        assert_eq!(api.count(Endpoint::Session), 2);
        assert!(!controller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_auth_rejection_keeps_polling() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("23", SessionStatus::Queued)));
        api.push_session(Endpoint::Session, Err(ApiError::http_empty(401)));
        api.push_session(Endpoint::Session, Ok(session("23", SessionStatus::Done)));
        api.push_results(Ok(results_with(1)));
        api.push_blob(Endpoint::Preview, Ok(png_blob("final")));
        let (controller, _registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        wait_for(&mut rx, finished).await;

        assert!(controller.has_results());
        assert!(controller.snapshot().error.is_none());
        assert_eq!(api.count(Endpoint::Session), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_poll_failures_stop_polling() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("24", SessionStatus::Queued)));
        api.push_session(Endpoint::Session, Err(ApiError::http(500, "down")));
        let (controller, _registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        let event = wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::PollFailed { .. })
        })
        .await;
        assert_eq!(
            event,
            SessionEvent::PollFailed {
                message: "down".to_string()
            }
        );
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(api.count(Endpoint::Session), 1);
        assert_eq!(api.count(Endpoint::Results), 0);
        assert_eq!(
            controller.snapshot().error.map(|err| err.message),
            Some("down".to_string())
        );
        assert!(!controller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_slide_runs_its_preview_session() {
        let api = ScriptedApi::new();
        api.push_session(
            Endpoint::CreatePreview,
            Ok(session("31", SessionStatus::Uploaded)),
        );
        api.push_blob(Endpoint::Preview, Ok(png_blob("slide")));
        api.push_session(
            Endpoint::Run,
            Ok(AnalysisSession {
                status: Some(SessionStatus::Queued),
                ..AnalysisSession::default()
            }),
        );
        api.push_session(Endpoint::Session, Ok(session("31", SessionStatus::Done)));
        api.push_results(Ok(results_with(2)));
        api.push_blob(Endpoint::Preview, Ok(png_blob("finalized")));
        let (controller, _registry, mut rx) = controller(&api);

        controller.select_file(slide("case.svs")).await.expect("svs");
        assert!(controller.start_analysis().await.expect("started"));
        wait_for(&mut rx, finished).await;

        assert_eq!(api.count(Endpoint::Create), 0);
        assert_eq!(api.calls_with_args(Endpoint::Run), vec![Some("31".to_string())]);
        assert_eq!(
            api.calls_with_args(Endpoint::Session),
            vec![Some("31".to_string())]
        );
        let snapshot = controller.snapshot();
        assert!(snapshot.has_results());
        assert_eq!(
            snapshot.preview.expect("finalized preview").byte_len,
            "finalized".len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_id_ends_the_attempt() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(AnalysisSession::default()));
        let (controller, _registry, _rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        let err = controller.start_analysis().await.expect_err("no id");
        assert_eq!(err.kind, ErrorKind::MissingSession);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let snapshot = controller.snapshot();
        assert!(!snapshot.uploading);
        assert!(!snapshot.is_busy());
        assert!(!controller.is_polling());
        assert_eq!(api.count(Endpoint::Session), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_failure_is_recorded() {
        let api = ScriptedApi::new();
        api.push_session(
            Endpoint::Create,
            Err(ApiError::http(413, crate::error::PAYLOAD_TOO_LARGE_MESSAGE)),
        );
        let (controller, _registry, _rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        let err = controller.start_analysis().await.expect_err("rejected");
        assert_eq!(err.status, Some(413));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.error, Some(err));
        assert!(!snapshot.uploading);
        assert!(!controller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_while_polling_stops_requests() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("25", SessionStatus::Queued)));
        for _ in 0..10 {
            api.push_session(Endpoint::Session, Ok(session("25", SessionStatus::Running)));
        }
        let (controller, _registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::StatusChanged { .. })
        })
        .await;

        controller.clear();
        let seen = api.count(Endpoint::Session);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.count(Endpoint::Session), seen);
        assert!(!controller.is_polling());
        assert!(controller.snapshot().status.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_upload_discards_created_session() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("27", SessionStatus::Queued)));
        let gate = api.gate(Endpoint::Create);
        let (controller, registry, _rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start_analysis().await })
        };
        gate.wait_entered().await;
        assert!(controller.snapshot().uploading);
        controller.clear();
        gate.release();

        assert!(!pending.await.expect("join").expect("superseded, not failed"));
        tokio::time::sleep(Duration::from_secs(30)).await;

        let snapshot = controller.snapshot();
        assert!(snapshot.file_name.is_none());
        assert!(snapshot.session_id.is_none());
        assert!(!snapshot.uploading);
        assert!(!snapshot.is_busy());
        assert!(!controller.is_polling());
        assert_eq!(api.count(Endpoint::Session), 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_hydration_discards_results() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("28", SessionStatus::Queued)));
        api.push_session(Endpoint::Session, Ok(session("28", SessionStatus::Done)));
        api.push_results(Ok(results_with(2)));
        api.push_blob(Endpoint::Preview, Ok(png_blob("final")));
        let gate = api.gate(Endpoint::Results);
        let (controller, registry, _rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        gate.wait_entered().await;
        controller.clear();
        gate.release();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let snapshot = controller.snapshot();
        assert!(snapshot.results.is_none());
        assert!(snapshot.status.is_none());
        assert!(snapshot.preview.is_none());
        assert!(!snapshot.has_results());
        assert!(!controller.is_polling());
        assert_eq!(api.count(Endpoint::Results), 1);
        assert_eq!(api.count(Endpoint::Preview), 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_controller_releases_preview_and_polling() {
        let api = ScriptedApi::new();
        api.push_session(Endpoint::Create, Ok(session("26", SessionStatus::Queued)));
        for _ in 0..10 {
            api.push_session(Endpoint::Session, Ok(session("26", SessionStatus::Running)));
        }
        let (controller, registry, mut rx) = controller(&api);

        controller.select_file(jpg("cells.jpg")).await.expect("jpg");
        controller.start_analysis().await.expect("started");
        wait_for(&mut rx, |event| {
            matches!(event, SessionEvent::StatusChanged { .. })
        })
        .await;
        assert_eq!(registry.live_count(), 1);

        drop(controller);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let seen = api.count(Endpoint::Session);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.count(Endpoint::Session), seen);
        assert_eq!(registry.live_count(), 0);
    }
}
