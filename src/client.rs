use crate::api::PipelineApi;
use crate::candidate::{CandidateSource, UploadCandidate};
use crate::credentials::CredentialStore;
use crate::dto::{AnalysisSession, Blob, ResultSet, SessionId};
use crate::error::{ApiError, PAYLOAD_TOO_LARGE_MESSAGE, UNKNOWN_MESSAGE};
use anyhow::{Result, bail};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CREATE_FAILED_MESSAGE: &str = "Failed to create the session.";

/// Response body as the backend sent it.
#[derive(Debug, Clone, PartialEq)]
enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
}

/// `PipelineApi` over HTTP.
///
/// JSON and binary requests are bounded by the request timeout; uploads are
/// not, since slide files can be several gigabytes.
pub struct HttpPipelineApi {
    client: Client,
    base: Url,
    timeout: Duration,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpPipelineApi {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))?;
        if base.cannot_be_a_base() {
            bail!("base URL {base_url} cannot carry a path");
        }
        let client = Client::builder().cookie_store(true).build()?;
        Ok(Self {
            client,
            base,
            timeout,
            credentials,
        })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn session_endpoint(&self, id: &SessionId, tail: &[&str]) -> Url {
        let segments = ["pipeline", "sessions", id.as_str()];
        self.endpoint(segments.into_iter().chain(tail.iter().copied()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.get() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        self.authorize(request)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!("GET {url}");
        let response = self
            .send(self.client.get(url).timeout(self.timeout))
            .await?;
        self.read_json(response).await
    }

    async fn post_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!("POST {url}");
        let response = self
            .send(self.client.post(url).timeout(self.timeout))
            .await?;
        self.read_json(response).await
    }

    async fn get_blob(&self, request: RequestBuilder) -> Result<Blob, ApiError> {
        let response = self.send(request.timeout(self.timeout)).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await?;
            return Err(self.reject(status, body));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(Blob {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response) -> Result<T, ApiError> {
        let status = response.status();
        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(self.reject(status, body));
        }
        let value = match body {
            ResponseBody::Json(value) => value,
            ResponseBody::Empty => Value::Null,
            ResponseBody::Text(text) => {
                serde_json::from_str(&text).map_err(|_| unexpected_response())?
            }
        };
        serde_json::from_value(value).map_err(|err| {
            debug!("response did not match the expected shape: {err}");
            unexpected_response()
        })
    }

    fn reject(&self, status: StatusCode, body: ResponseBody) -> ApiError {
        let err = normalize_error(status.as_u16(), &body);
        if err.requires_sign_in() && matches!(body, ResponseBody::Json(_)) {
            warn!("backend rejected the credential ({status}); clearing it");
            if let Err(clear_err) = self.credentials.clear() {
                warn!("failed to clear credential: {clear_err:#}");
            }
        }
        err
    }

    async fn upload(&self, url: Url, file: &UploadCandidate) -> Result<AnalysisSession, ApiError> {
        debug!("POST {url} ({} bytes)", file.size);
        let part = file_part(file).await?;
        let form = Form::new().part("file", part);
        let response = self.send(self.client.post(url).multipart(form)).await?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                return Err(ApiError::http(status.as_u16(), PAYLOAD_TOO_LARGE_MESSAGE));
            }
            let body = match read_body(response).await? {
                ResponseBody::Empty => ResponseBody::Text(CREATE_FAILED_MESSAGE.to_string()),
                ResponseBody::Text(text) if text.trim().is_empty() => {
                    ResponseBody::Text(CREATE_FAILED_MESSAGE.to_string())
                }
                body => body,
            };
            return Err(self.reject(status, body));
        }
        self.read_json(response).await
    }
}

async fn file_part(file: &UploadCandidate) -> Result<Part, ApiError> {
    let part = match &file.source {
        CandidateSource::Memory(bytes) => Part::bytes(bytes.to_vec()),
        CandidateSource::Path(path) => {
            let handle = tokio::fs::File::open(path).await.map_err(|err| {
                ApiError::validation(format!("Could not read {}: {err}", path.display()))
            })?;
            Part::stream_with_length(Body::from(handle), file.size)
        }
    };
    part.file_name(file.name.clone())
        .mime_str(file.mime_type())
        .map_err(|_| ApiError::validation(format!("Invalid content type for {}", file.name)))
}

async fn read_body(response: Response) -> Result<ResponseBody, ApiError> {
    let status = response.status();
    let declared_empty = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|len| len.trim() == "0");
    if matches!(status.as_u16(), 204 | 205) || declared_empty {
        return Ok(ResponseBody::Empty);
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let raw = response.text().await.map_err(transport_error)?;
    Ok(parse_body(content_type.as_deref(), raw))
}

fn parse_body(content_type: Option<&str>, raw: String) -> ResponseBody {
    if raw.is_empty() {
        return ResponseBody::Empty;
    }
    if content_type.is_some_and(|ct| ct.contains("application/json"))
        && let Ok(value) = serde_json::from_str(&raw)
    {
        return ResponseBody::Json(value);
    }
    ResponseBody::Text(raw)
}

fn normalize_error(status: u16, body: &ResponseBody) -> ApiError {
    match body {
        ResponseBody::Empty => ApiError::http_empty(status),
        ResponseBody::Json(Value::Object(map)) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| map.get("error").and_then(Value::as_str))
                .unwrap_or(UNKNOWN_MESSAGE);
            let err = ApiError::http(status, message);
            match map.get("fieldErrors").and_then(Value::as_object) {
                Some(fields) => {
                    let fields: BTreeMap<String, String> = fields
                        .iter()
                        .map(|(field, value)| {
                            let text = value
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| value.to_string());
                            (field.clone(), text)
                        })
                        .collect();
                    err.with_field_errors(fields)
                }
                None => err,
            }
        }
        ResponseBody::Json(Value::String(text)) | ResponseBody::Text(text)
            if !text.trim().is_empty() =>
        {
            ApiError::http(status, text.clone())
        }
        _ => ApiError::http(status, UNKNOWN_MESSAGE),
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::timeout()
    } else {
        debug!("request failed: {err}");
        ApiError::network()
    }
}

fn unexpected_response() -> ApiError {
    ApiError::decode("Unexpected response from the server.")
}

#[async_trait]
impl PipelineApi for HttpPipelineApi {
    async fn create_session(&self, file: &UploadCandidate) -> Result<AnalysisSession, ApiError> {
        let url = self.endpoint(["pipeline", "sessions"]);
        self.upload(url, file).await
    }

    async fn create_preview_session(
        &self,
        file: &UploadCandidate,
    ) -> Result<AnalysisSession, ApiError> {
        let url = self.endpoint(["pipeline", "sessions", "preview"]);
        self.upload(url, file).await
    }

    async fn run_session(&self, id: &SessionId) -> Result<AnalysisSession, ApiError> {
        self.post_json(self.session_endpoint(id, &["run"])).await
    }

    async fn session(&self, id: &SessionId) -> Result<AnalysisSession, ApiError> {
        self.get_json(self.session_endpoint(id, &[])).await
    }

    async fn results(&self, id: &SessionId) -> Result<ResultSet, ApiError> {
        self.get_json(self.session_endpoint(id, &["results"])).await
    }

    async fn preview(&self, id: &SessionId) -> Result<Blob, ApiError> {
        let url = self.session_endpoint(id, &["preview"]);
        debug!("GET {url}");
        self.get_blob(self.client.get(url)).await
    }

    async fn patch(&self, id: &SessionId, rel_path: &str) -> Result<Blob, ApiError> {
        let url = patch_url(self.session_endpoint(id, &["files"]), rel_path);
        debug!("GET {url}");
        self.get_blob(self.client.get(url)).await
    }

    async fn download_patch(&self, id: &SessionId, rel_path: &str) -> Result<Blob, ApiError> {
        let url = self.session_endpoint(id, &["download-patch"]);
        debug!("GET {url} relPath={rel_path}");
        self.get_blob(self.client.get(url).query(&[("relPath", rel_path)]))
            .await
    }

    async fn download_cells(&self, id: &SessionId) -> Result<Blob, ApiError> {
        let url = self.session_endpoint(id, &["download-cells"]);
        debug!("GET {url}");
        self.get_blob(self.client.get(url)).await
    }
}

fn patch_url(mut files: Url, rel_path: &str) -> Url {
    if let Ok(mut path) = files.path_segments_mut() {
        path.extend(rel_path.split('/').filter(|segment| !segment.is_empty()));
    }
    files
}
