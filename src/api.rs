use crate::candidate::UploadCandidate;
use crate::dto::{AnalysisSession, Blob, ResultSet, SessionId};
use crate::error::ApiError;
use async_trait::async_trait;

/// The analysis backend's REST surface under `/pipeline/sessions`.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// `POST /pipeline/sessions`: upload and start a full analysis.
    async fn create_session(&self, file: &UploadCandidate) -> Result<AnalysisSession, ApiError>;

    /// `POST /pipeline/sessions/preview`: upload and only render a preview.
    async fn create_preview_session(
        &self,
        file: &UploadCandidate,
    ) -> Result<AnalysisSession, ApiError>;

    /// `POST /pipeline/sessions/{id}/run`
    async fn run_session(&self, id: &SessionId) -> Result<AnalysisSession, ApiError>;

    /// `GET /pipeline/sessions/{id}`
    async fn session(&self, id: &SessionId) -> Result<AnalysisSession, ApiError>;

    /// `GET /pipeline/sessions/{id}/results`
    async fn results(&self, id: &SessionId) -> Result<ResultSet, ApiError>;

    /// `GET /pipeline/sessions/{id}/preview`
    async fn preview(&self, id: &SessionId) -> Result<Blob, ApiError>;

    /// `GET /pipeline/sessions/{id}/files/{rel_path}`
    async fn patch(&self, id: &SessionId, rel_path: &str) -> Result<Blob, ApiError>;

    /// `GET /pipeline/sessions/{id}/download-patch?relPath=...`
    async fn download_patch(&self, id: &SessionId, rel_path: &str) -> Result<Blob, ApiError>;

    /// `GET /pipeline/sessions/{id}/download-cells`
    async fn download_cells(&self, id: &SessionId) -> Result<Blob, ApiError>;
}
