use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "MEDROUTER_API_KEY";
/// Environment variable overriding the API base URL.
pub const API_URL_ENV: &str = "MEDROUTER_API_URL";

const DEFAULT_URL: &str = "https://api.medrouter.co";

/// Base URL of the MedRouter API.
///
/// The production API is used by default. Another environment can be targeted by setting
/// the `MEDROUTER_API_URL` environment variable and building the URL with
/// [MedRouterUrl::from_envar], or by passing the base URL directly to the `*_with_url`
/// functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedRouterUrl(String);

impl Default for MedRouterUrl {
    fn default() -> Self {
        MedRouterUrl(DEFAULT_URL.to_string())
    }
}

impl MedRouterUrl {
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        MedRouterUrl(url.trim_end_matches('/').to_string())
    }

    /// Reads `MEDROUTER_API_URL`, falling back to the production URL when it is unset or blank.
    pub fn from_envar() -> Self {
        MedRouterUrl::from_value(env::var(API_URL_ENV).ok())
    }

    fn from_value(value: Option<String>) -> Self {
        match value {
            Some(url) if !url.trim().is_empty() => MedRouterUrl::new(url.trim()),
            _ => MedRouterUrl::default(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MedRouterUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn inference_endpoint(url: &str) -> String {
    format!("{}/api/inference/use/", url.trim_end_matches('/'))
}

pub(crate) fn request_endpoint(url: &str, request_id: &str) -> String {
    format!("{}/api/requests/{}", url.trim_end_matches('/'), request_id)
}

/// Reads the API key from `MEDROUTER_API_KEY`.
pub fn api_key_from_envar() -> Result<String, MedRouterError> {
    api_key_from_value(env::var(API_KEY_ENV).ok())
}

fn api_key_from_value(value: Option<String>) -> Result<String, MedRouterError> {
    match value {
        Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(MedRouterError::ApiKey(format!("{} is not set", API_KEY_ENV))),
    }
}

/// Additional artifact the server renders next to the segmentation masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraOutputType {
    Ply,
    Stl,
    Obj,
}

impl ExtraOutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtraOutputType::Ply => "ply",
            ExtraOutputType::Stl => "stl",
            ExtraOutputType::Obj => "obj",
        }
    }
}

/// Key of the `output` map of a processed request, i.e. the kind of artifact to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Nifti,
    Stl,
    Ply,
    Obj,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Nifti => "nifti",
            OutputFormat::Stl => "stl",
            OutputFormat::Ply => "ply",
            OutputFormat::Obj => "obj",
        }
    }

    /// Extension given to the downloaded files.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Nifti => "nii.gz",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata sent along with the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceParams {
    /// Name of the model, e.g. `total-segmentator`.
    pub model: String,
    pub model_id: String,
    /// Free text forwarded to the model.
    pub notes: String,
    pub extra_output_type: Option<ExtraOutputType>,
    /// Ask the server to validate the input before running the model.
    pub prechecks: bool,
}

impl InferenceParams {
    pub fn new(model: impl Into<String>, model_id: impl ToString) -> Self {
        InferenceParams {
            model: model.into(),
            model_id: model_id.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), MedRouterError> {
        if self.model.trim().is_empty() || self.model_id.trim().is_empty() {
            return Err(MedRouterError::ModelNotFound(format!(
                "model '{}' with id '{}'",
                self.model, self.model_id
            )));
        }
        Ok(())
    }

    /// Text fields of the upload form, `extra_output_type` only when set.
    pub(crate) fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("model", self.model.clone()),
            ("model_id", self.model_id.clone()),
            ("notes", self.notes.clone()),
            ("prechecks", self.prechecks.to_string()),
        ];
        if let Some(extra) = self.extra_output_type {
            fields.push(("extra_output_type", extra.as_str().to_string()));
        }
        fields
    }
}

/// What kind of input is uploaded, deduced from the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `.nii` or `.nii.gz` volume.
    Nifti,
    /// Zip archive of DICOM files.
    DicomZip,
    /// Directory of DICOM files, zipped before the upload.
    DicomFolder,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Result<Self, MedRouterError> {
        if path.is_dir() {
            return Ok(SourceKind::DicomFolder);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Ok(SourceKind::Nifti)
        } else if name.ends_with(".zip") {
            Ok(SourceKind::DicomZip)
        } else {
            Err(MedRouterError::UnsupportedFileType(path.to_path_buf()))
        }
    }

    pub(crate) fn mime(&self) -> &'static str {
        match self {
            SourceKind::Nifti => "application/octet-stream",
            SourceKind::DicomZip | SourceKind::DicomFolder => "application/zip",
        }
    }
}

/// How often and how many times the status endpoint is queried.
///
/// `max_retries` counts the requests made after the first one, so a policy performs at
/// most `max_retries + 1` status requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_secs(15),
            max_retries: 40,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        PollPolicy {
            interval,
            max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Processed,
    Failed,
    Pending,
    Processing,
    Queued,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Processed | RequestStatus::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            RequestStatus::Processed => "processed",
            RequestStatus::Failed => "failed",
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Queued => "queued",
            RequestStatus::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

/// Body of `GET /api/requests/{id}`.
///
/// `output` maps an artifact format (`nifti`, `stl`, ...) to a map of artifact name to
/// download URL. `message` and `error` are kept as sent, whatever their JSON type. Fields the
/// client does not know about are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusResponse {
    pub(crate) fn failure_reason(&self) -> String {
        [&self.error, &self.message]
            .into_iter()
            .flatten()
            .find_map(|value| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(text) if text.trim().is_empty() => None,
                serde_json::Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| "the server reported the request as failed".to_string())
    }
}

#[derive(Error, Debug)]
pub enum MedRouterError {
    #[error("API key error: {0}")]
    ApiKey(String),
    #[error("Unsupported file type: {}", .0.display())]
    UnsupportedFileType(PathBuf),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Precheck error: {0}")]
    Precheck(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Unexpected response status {status}: {body}")]
    StatusResponse { status: StatusCode, body: String },
    #[error("Request {request_id} still not processed after {attempts} status checks")]
    PollTimeout { request_id: String, attempts: u32 },
    #[error("No '{0}' outputs in the response")]
    MissingOutput(String),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}
