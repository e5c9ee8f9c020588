use std::path::Path;

use tracing::info;

use crate::{
    get::wait_for_done_with_url,
    post::post_with_url,
    structs::{
        api_key_from_envar, InferenceParams, MedRouterError, MedRouterUrl, PollPolicy,
        StatusResponse,
    },
};

/// Uploads a scan and waits for its results, with the URL and key found in the environment.
pub async fn process(
    source: impl AsRef<Path>,
    params: &InferenceParams,
    policy: &PollPolicy,
) -> Result<StatusResponse, MedRouterError> {
    let key = api_key_from_envar()?;
    process_with_url(
        MedRouterUrl::from_envar().as_str(),
        &key,
        source.as_ref(),
        params,
        policy,
    )
    .await
}

/// Uploads a scan, then polls its request until it is processed.
///
/// This is [post_with_url] followed by [wait_for_done_with_url], and fails the same way.
/// The returned response holds the output URLs, see [crate::download()].
pub async fn process_with_url(
    url: &str,
    key: &str,
    source: &Path,
    params: &InferenceParams,
    policy: &PollPolicy,
) -> Result<StatusResponse, MedRouterError> {
    let request_id = post_with_url(url, key, source, params).await?;

    info!(
        "Waiting for request {} (every {:?}, {} retries at most)",
        request_id, policy.interval, policy.max_retries
    );

    wait_for_done_with_url(url, key, &request_id, policy).await
}
