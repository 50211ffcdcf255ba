use crate::error::ApiError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ACCEPTED_EXTENSIONS: [&str; 4] = ["svs", "png", "jpg", "jpeg"];
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024 * 1024; // 5 GiB

pub const UNSUPPORTED_FORMAT_MESSAGE: &str = "Unsupported format. Use .svs, .png or .jpg";
pub const TOO_LARGE_MESSAGE: &str = "File exceeds maximum size of 5 GB.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Browser-decodable raster; previewed locally.
    Image,
    /// Scanner format that needs a server-rendered preview.
    WholeSlide,
}

#[derive(Debug, Clone)]
pub enum CandidateSource {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

/// A file the user picked for analysis.
///
/// `size` is the declared size, checked before any bytes are read.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    pub name: String,
    pub size: u64,
    pub source: CandidateSource,
}

impl UploadCandidate {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("failed to read metadata for {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            size: metadata.len(),
            source: CandidateSource::Path(path.to_path_buf()),
        })
    }

    pub fn in_memory(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            source: CandidateSource::Memory(bytes),
        }
    }

    /// Lower-cased text after the last dot; empty when there is none.
    pub fn extension(&self) -> String {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<FileKind, ApiError> {
        let ext = self.extension();
        if !ACCEPTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ApiError::validation(UNSUPPORTED_FORMAT_MESSAGE));
        }
        if self.size > MAX_UPLOAD_BYTES {
            return Err(ApiError::validation(TOO_LARGE_MESSAGE));
        }
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(FileKind::Image)
        } else {
            Ok(FileKind::WholeSlide)
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.extension().as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            _ => "application/octet-stream",
        }
    }

    pub async fn read_bytes(&self) -> std::io::Result<Arc<[u8]>> {
        match &self.source {
            CandidateSource::Memory(bytes) => Ok(Arc::clone(bytes)),
            CandidateSource::Path(path) => Ok(tokio::fs::read(path).await?.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CandidateSource, FileKind, MAX_UPLOAD_BYTES, TOO_LARGE_MESSAGE, UploadCandidate,
    };
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn declared(name: &str, size: u64) -> UploadCandidate {
        UploadCandidate {
            name: name.to_string(),
            size,
            source: CandidateSource::Memory(Arc::from(&b""[..])),
        }
    }

    #[test]
    fn classifies_accepted_extensions() {
        assert_eq!(declared("a.png", 10).validate(), Ok(FileKind::Image));
        assert_eq!(declared("a.JPG", 10).validate(), Ok(FileKind::Image));
        assert_eq!(declared("scan.jpeg", 10).validate(), Ok(FileKind::Image));
        assert_eq!(declared("slide.SVS", 10).validate(), Ok(FileKind::WholeSlide));
    }

    #[test]
    fn rejects_other_extensions() {
        for name in ["notes.txt", "slide.svs.zip", "png", "archive.tiff", ""] {
            let err = declared(name, 10).validate().expect_err(name);
            assert_eq!(err.kind, ErrorKind::Validation);
        }
    }

    #[test]
    fn rejects_oversized_files_regardless_of_extension() {
        let six_gib = 6 * 1024 * 1024 * 1024;
        for name in ["slide.svs", "a.png", "a.exe"] {
            let err = declared(name, six_gib).validate().expect_err(name);
            assert_eq!(err.kind, ErrorKind::Validation);
        }
        let err = declared("slide.svs", six_gib).validate().unwrap_err();
        assert_eq!(err.message, TOO_LARGE_MESSAGE);
        assert!(err.message.contains("exceeds maximum size"));
    }

    #[test]
    fn ceiling_is_inclusive() {
        assert!(declared("a.svs", MAX_UPLOAD_BYTES).validate().is_ok());
        assert!(declared("a.svs", MAX_UPLOAD_BYTES + 1).validate().is_err());
    }

    #[test]
    fn reads_size_and_name_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cells.png");
        std::fs::write(&path, b"0123456789").expect("write");

        let candidate = UploadCandidate::from_path(&path).expect("candidate");
        assert_eq!(candidate.name, "cells.png");
        assert_eq!(candidate.size, 10);
        assert_eq!(candidate.mime_type(), "image/png");
    }
}
