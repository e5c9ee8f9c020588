use std::fmt;

use reqwest::{header, Client, Response, StatusCode};
use tracing::error;

use crate::structs::MedRouterError;

/// Endpoint a response comes from, used to pick the right error for a failed request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Endpoint<'a> {
    Upload { model: &'a str },
    Status { request_id: &'a str },
    Artifact { name: &'a str },
}

impl fmt::Display for Endpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Upload { model } => write!(f, "upload for model {}", model),
            Endpoint::Status { request_id } => write!(f, "status of request {}", request_id),
            Endpoint::Artifact { name } => write!(f, "download of {}", name),
        }
    }
}

/// Builds a client sending the API key in the `Authorization` header of every request.
pub(crate) fn authorized_client(key: &str) -> Result<Client, MedRouterError> {
    if key.trim().is_empty() {
        return Err(MedRouterError::ApiKey("the API key is empty".to_string()));
    }

    let mut headers = header::HeaderMap::new();

    let mut api_key = header::HeaderValue::from_str(key)?;
    api_key.set_sensitive(true);

    headers.insert(header::AUTHORIZATION, api_key);

    Ok(Client::builder().default_headers(headers).build()?)
}

/// Passes 2xx responses through and turns anything else into a [MedRouterError].
pub(crate) async fn ensure_success(
    response: Response,
    endpoint: Endpoint<'_>,
) -> Result<Response, MedRouterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!("Error {} during {}: {}", status, endpoint, body);

    Err(error_for_status(status, body, endpoint))
}

fn error_for_status(status: StatusCode, body: String, endpoint: Endpoint<'_>) -> MedRouterError {
    match (status, endpoint) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Endpoint::Upload { .. })
        | (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, Endpoint::Status { .. }) => {
            MedRouterError::ApiKey(format!("the API rejected the key ({})", status))
        }
        (StatusCode::NOT_FOUND, Endpoint::Upload { model }) => {
            MedRouterError::ModelNotFound(model.to_string())
        }
        (StatusCode::NOT_FOUND, Endpoint::Status { request_id }) => {
            MedRouterError::Inference(format!("request {} not found", request_id))
        }
        (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _)
            if body.to_lowercase().contains("precheck") =>
        {
            MedRouterError::Precheck(body)
        }
        _ => MedRouterError::StatusResponse { status, body },
    }
}
