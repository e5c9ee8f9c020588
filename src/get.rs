use reqwest::{header, Client};
use tracing::{debug, error, info};

use crate::{
    client::{authorized_client, ensure_success, Endpoint},
    structs::{
        api_key_from_envar, request_endpoint, MedRouterError, MedRouterUrl, PollPolicy,
        RequestStatus, StatusResponse,
    },
};

/// Fetches the current state of a request, with the URL and key found in the environment.
pub async fn get(request_id: &str) -> Result<StatusResponse, MedRouterError> {
    let key = api_key_from_envar()?;
    get_with_url(MedRouterUrl::from_envar().as_str(), &key, request_id).await
}

/// Fetches the current state of a request.
///
/// A single request is made, whatever the status. Use [wait_for_done_with_url] to poll
/// until the request is processed.
pub async fn get_with_url(
    url: &str,
    key: &str,
    request_id: &str,
) -> Result<StatusResponse, MedRouterError> {
    let client = authorized_client(key)?;
    fetch_status(&client, url, request_id).await
}

/// Polls the request until it is processed, with the URL and key found in the environment.
pub async fn wait_for_done(
    request_id: &str,
    policy: &PollPolicy,
) -> Result<StatusResponse, MedRouterError> {
    let key = api_key_from_envar()?;
    wait_for_done_with_url(MedRouterUrl::from_envar().as_str(), &key, request_id, policy).await
}

/// Polls the status endpoint until the request reaches a terminal status.
///
/// The status is requested at most `policy.max_retries + 1` times, waiting
/// `policy.interval` between two requests.
///
/// # Returns
///
/// * The response of the request once its status is `processed`.
///
/// # Errors
///
/// [MedRouterError::Inference] if the server reports the request as `failed`, and
/// [MedRouterError::PollTimeout] if the retries are exhausted before a terminal status.
pub async fn wait_for_done_with_url(
    url: &str,
    key: &str,
    request_id: &str,
    policy: &PollPolicy,
) -> Result<StatusResponse, MedRouterError> {
    let client = authorized_client(key)?;

    for attempt in 0..=policy.max_retries {
        let response = fetch_status(&client, url, request_id).await?;

        match response.status {
            RequestStatus::Processed => {
                info!("Request {} processed.", request_id);
                return Ok(response);
            }
            RequestStatus::Failed => {
                let reason = response.failure_reason();
                error!("Request {} failed: {}", request_id, reason);
                return Err(MedRouterError::Inference(reason));
            }
            status if attempt < policy.max_retries => {
                info!(
                    "Request {} status = '{}', checking again in {:?} ({}/{})",
                    request_id,
                    status,
                    policy.interval,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(policy.interval).await;
            }
            status => debug!("Request {} status = '{}', no retry left.", request_id, status),
        }
    }

    Err(MedRouterError::PollTimeout {
        request_id: request_id.to_string(),
        attempts: policy.max_retries.saturating_add(1),
    })
}

async fn fetch_status(
    client: &Client,
    url: &str,
    request_id: &str,
) -> Result<StatusResponse, MedRouterError> {
    let start = std::time::Instant::now();

    let response = client
        .get(request_endpoint(url, request_id))
        .header(header::ACCEPT, "application/json")
        .send()
        .await?;

    debug!(
        "Time to get status of request {} : {:?}",
        request_id,
        start.elapsed()
    );

    let response = ensure_success(response, Endpoint::Status { request_id }).await?;

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn quick(max_retries: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(5), max_retries)
    }

    async fn mount_status(server: &MockServer, body: serde_json::Value, times: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path("/api/requests/42"))
            .and(header("Authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body));
        match times {
            Some(n) => mock.up_to_n_times(n).mount(server).await,
            None => mock.mount(server).await,
        }
    }

    #[tokio::test]
    async fn test_get_single_request() {
        let server = MockServer::start().await;
        mount_status(&server, json!({ "status": "processing" }), None).await;

        let response = get_with_url(&server.uri(), "secret", "42").await.unwrap();
        assert_eq!(RequestStatus::Processing, response.status);
        assert_eq!(1, server.received_requests().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_wait_until_processed() {
        let server = MockServer::start().await;
        mount_status(&server, json!({ "status": "pending" }), Some(2)).await;
        mount_status(
            &server,
            json!({ "status": "processed", "output": { "nifti": {} } }),
            None,
        )
        .await;

        let response = wait_for_done_with_url(&server.uri(), "secret", "42", &quick(5))
            .await
            .unwrap();
        assert_eq!(RequestStatus::Processed, response.status);
        assert_eq!(3, server.received_requests().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_wait_failed_request() {
        let server = MockServer::start().await;
        mount_status(
            &server,
            json!({ "status": "failed", "error": "input is not a CT" }),
            None,
        )
        .await;

        match wait_for_done_with_url(&server.uri(), "secret", "42", &quick(5)).await {
            Err(MedRouterError::Inference(reason)) => assert_eq!("input is not a CT", reason),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_failed_request_with_structured_error() {
        let server = MockServer::start().await;
        mount_status(
            &server,
            json!({ "status": "failed", "error": { "detail": "bad scan" } }),
            None,
        )
        .await;

        match wait_for_done_with_url(&server.uri(), "secret", "42", &quick(0)).await {
            Err(MedRouterError::Inference(reason)) => assert!(reason.contains("bad scan")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_retries_exhausted() {
        let server = MockServer::start().await;
        mount_status(&server, json!({ "status": "processing" }), None).await;

        match wait_for_done_with_url(&server.uri(), "secret", "42", &quick(2)).await {
            Err(MedRouterError::PollTimeout {
                request_id,
                attempts,
            }) => {
                assert_eq!("42", request_id);
                assert_eq!(3, attempts);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(3, server.received_requests().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_wait_without_retries() {
        let server = MockServer::start().await;
        mount_status(&server, json!({ "status": "queued" }), None).await;

        assert!(matches!(
            wait_for_done_with_url(&server.uri(), "secret", "42", &quick(0)).await,
            Err(MedRouterError::PollTimeout { attempts: 1, .. })
        ));
        assert_eq!(1, server.received_requests().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_wait_unknown_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/requests/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(matches!(
            wait_for_done_with_url(&server.uri(), "secret", "42", &quick(3)).await,
            Err(MedRouterError::Inference(_))
        ));
    }
}
