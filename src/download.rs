use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use futures_util::StreamExt;
use reqwest::{Client, Response};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    client::{ensure_success, Endpoint},
    structs::{MedRouterError, OutputFormat, StatusResponse},
};

/// Returns the artifact name to URL map of a processed request for the given format.
///
/// Entries whose value is not a string are ignored.
pub fn output_urls(
    response: &StatusResponse,
    format: OutputFormat,
) -> Result<BTreeMap<String, String>, MedRouterError> {
    let entries = response
        .output
        .as_ref()
        .and_then(|output| output.get(format.as_str()))
        .and_then(|entries| entries.as_object())
        .ok_or_else(|| MedRouterError::MissingOutput(format.to_string()))?;

    Ok(entries
        .iter()
        .filter_map(|(name, url)| url.as_str().map(|url| (name.clone(), url.to_string())))
        .collect())
}

/// Downloads every artifact of `format` into `dir`, as `{name}.{extension}`.
///
/// Names which end up identical once made safe for the file system get a `-1`, `-2`, ...
/// suffix, so every artifact has its own file. Each file is written as `{name}.{extension}.part`
/// and renamed once complete; an interrupted download leaves nothing behind.
///
/// The directory is created if needed. The artifact URLs are pre-signed, so no API key is
/// sent with these requests.
///
/// # Returns
///
/// * The path of each downloaded file, by artifact name.
pub async fn download(
    response: &StatusResponse,
    format: OutputFormat,
    dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, MedRouterError> {
    let urls = output_urls(response, format)?;

    tokio::fs::create_dir_all(dir).await?;

    let client = Client::new();
    let mut local = BTreeMap::new();
    let mut used = HashSet::new();

    for (name, url) in urls {
        let stem = unique_stem(&name, &mut used);
        let destination = dir.join(format!("{}.{}", stem, format.extension()));
        info!("Downloading {} ...", name);
        download_file(&client, &name, &url, &destination).await?;
        local.insert(name, destination);
    }

    info!("{} {} file(s) downloaded to {}", local.len(), format, dir.display());

    Ok(local)
}

async fn download_file(
    client: &Client,
    name: &str,
    url: &str,
    destination: &Path,
) -> Result<(), MedRouterError> {
    let start = std::time::Instant::now();

    let response = client.get(url).send().await?;
    let response = ensure_success(response, Endpoint::Artifact { name }).await?;

    // written next to the destination and renamed once complete
    let partial = destination.with_extension(match destination.extension() {
        Some(ext) => format!("{}.part", ext.to_string_lossy()),
        None => "part".to_string(),
    });
    if let Err(e) = write_stream(response, &partial).await {
        warn!("Download of {} interrupted: {}", name, e);
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, destination).await?;

    debug!("Time to download {} : {:?}", name, start.elapsed());

    Ok(())
}

async fn write_stream(response: Response, path: &Path) -> Result<(), MedRouterError> {
    let mut file = File::create(path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// [file_stem] of `name`, suffixed until it differs from every stem in `used`.
///
/// Stems are compared case-insensitively for case-insensitive file systems.
fn unique_stem(name: &str, used: &mut HashSet<String>) -> String {
    let base = file_stem(name);
    let mut stem = base.clone();
    let mut suffix = 1;
    while !used.insert(stem.to_lowercase()) {
        stem = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    stem
}

/// Keeps artifact names from escaping the output directory.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() => c,
            '-' | '_' | '.' | ' ' => c,
            _ => '_',
        })
        .collect();
    let stem = stem.trim_start_matches('.').trim();
    if stem.is_empty() {
        "output".to_string()
    } else {
        stem.to_string()
    }
}
