//! # medrouter_rs
//! ## Before you begin
//! This library is intended to be used with the MedRouter API. To use this library, you must have an API key,
//! which can be obtained from [MedRouter](https://medrouter.co).
//!
//! The functions without a `_with_url` suffix read the key from the `MEDROUTER_API_KEY` environment variable
//! and the API URL from `MEDROUTER_API_URL` (the production API when unset). More details in the
//! [MedRouterUrl] documentation.
//!
//! ## Description
//! **medrouter_rs** is a client library in Rust for the MedRouter API, a service running medical imaging
//! AI models (segmentation, ...) on uploaded scans. All the image processing happens on the server: this
//! library only moves files and requests around.
//!
//! The interaction with the API happens in three steps:
//!
//! 1. Uploading a NIfTI volume or a set of DICOM files with [post()] or [post_with_url()], which returns a request id.
//! 2. Polling the request with [get()], [wait_for_done()] or [wait_for_done_with_url()] until it is processed.
//! 3. Downloading the resulting artifacts with [download()].
//!
//! [process()] and [process_with_url()] chain the first two steps.
//!
//! The library provides a few structs and enums to support these interactions, including:
//!
//! * [InferenceParams] for the model to run and the metadata sent with the scan.
//! * [PollPolicy] for the delay between two status checks and the number of retries.
//! * [StatusResponse] and [RequestStatus] for the state of a request.
//! * [OutputFormat] and [ExtraOutputType] for the artifacts produced by the server.
//! * [MedRouterError] for everything that can go wrong.
//!
//! ## Example
//! ```rust no_run
//! use std::{path::Path, time::Duration};
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let mut params = medrouter_rs::InferenceParams::new("total-segmentator", 258);
//!     params.notes = "The patient has issue in the liver".to_string();
//!     params.extra_output_type = Some(medrouter_rs::ExtraOutputType::Ply);
//!
//!     let policy = medrouter_rs::PollPolicy::new(Duration::from_secs(15), 20);
//!
//!     let response = match medrouter_rs::process("scan.nii.gz", &params, &policy).await {
//!         Ok(res) => res,
//!         Err(e) => panic!("Error: {}", e),
//!     };
//!
//!     let files = medrouter_rs::download(&response, medrouter_rs::OutputFormat::Nifti, Path::new("results"))
//!         .await
//!         .unwrap();
//!     for (name, path) in files {
//!         println!("{}: {}", name, path.display());
//!     }
//! }
//! ```

mod client;
mod download;
mod get;
mod post;
mod process;
mod structs;

pub use download::{download, output_urls};
pub use get::{get, get_with_url, wait_for_done, wait_for_done_with_url};
pub use post::{post, post_with_url};
pub use process::{process, process_with_url};
pub use structs::{
    api_key_from_envar, ExtraOutputType, InferenceParams, MedRouterError, MedRouterUrl,
    OutputFormat, PollPolicy, RequestStatus, SourceKind, StatusResponse, API_KEY_ENV, API_URL_ENV,
};
