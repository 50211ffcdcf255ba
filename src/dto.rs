use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque backend session identifier. The backend may send it as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawId", into = "String")]
pub struct SessionId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

impl From<RawId> for SessionId {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Number(n) => Self(n.to_string()),
            RawId::Text(s) => Self(s),
        }
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Uploaded,
    Queued,
    Running,
    Done,
    Error,
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uploaded => "UPLOADED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Session record as returned by create, run and status requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSession {
    #[serde(default)]
    pub id: Option<SessionId>,
    #[serde(default, skip_serializing)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub slide_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub tallies: Tallies,
    #[serde(default)]
    pub possible_diagnosis: Option<String>,
}

impl AnalysisSession {
    pub fn identifier(&self) -> Option<&SessionId> {
        self.id.as_ref().or(self.session_id.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tallies {
    #[serde(default)]
    pub tiles_total: Option<u64>,
    #[serde(default)]
    pub not_background_total: Option<u64>,
    #[serde(default)]
    pub background_total: Option<u64>,
    #[serde(default)]
    pub apto_total: Option<u64>,
    #[serde(default)]
    pub no_apto_total: Option<u64>,
}

/// Payload of `GET /pipeline/sessions/{id}/results`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    #[serde(default)]
    pub possible_diagnosis: Option<String>,
    #[serde(flatten)]
    pub tallies: Tallies,
    #[serde(default)]
    pub top_patches: Vec<Patch>,
    #[serde(default)]
    pub pipeline_report_json: Option<String>,
}

/// One ranked tile from the results. Positions are in slide pixels, `norm_*` in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub rel_path: Option<String>,
    #[serde(default)]
    pub cls: Option<String>,
    #[serde(default)]
    pub cls_raw: Option<String>,
    #[serde(default)]
    pub conf: f64,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
    #[serde(default)]
    pub w: Option<i64>,
    #[serde(default)]
    pub h: Option<i64>,
    #[serde(default)]
    pub cx: Option<i64>,
    #[serde(default)]
    pub cy: Option<i64>,
    #[serde(default, rename = "normX", alias = "normx")]
    pub norm_x: Option<f64>,
    #[serde(default, rename = "normY", alias = "normy")]
    pub norm_y: Option<f64>,
}

impl Patch {
    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.norm_x?, self.norm_y?))
    }
}

/// Binary body of a preview, thumbnail or archive response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
        Other(serde::de::IgnoredAny),
    }

    let parsed = match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Raw::Seconds(secs)) => {
            let whole = secs.trunc() as i64;
            let nanos = (secs.fract() * 1e9).round() as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        Some(Raw::Other(_)) | None => None,
    };
    Ok(parsed)
}
