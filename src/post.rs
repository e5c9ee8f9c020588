use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use reqwest::{multipart, Body};
use serde_json::Value;
use tempfile::TempDir;
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    client::{authorized_client, ensure_success, Endpoint},
    structs::{
        api_key_from_envar, inference_endpoint, InferenceParams, MedRouterError, MedRouterUrl,
        SourceKind,
    },
};

/// Uploads a scan to the URL and with the key found in the environment.
///
/// See [post_with_url] for the details.
pub async fn post(
    source: impl AsRef<Path>,
    params: &InferenceParams,
) -> Result<String, MedRouterError> {
    let key = api_key_from_envar()?;
    post_with_url(
        MedRouterUrl::from_envar().as_str(),
        &key,
        source.as_ref(),
        params,
    )
    .await
}

/// Uploads a scan for inference and returns the request id assigned by the server.
///
/// # Arguments
///
/// * `url` - Base URL of the API.
/// * `key` - The API key.
/// * `source` - A NIfTI volume (`.nii`, `.nii.gz`), a zip of DICOM files, or a directory of
///   DICOM files which is zipped before the upload.
/// * `params` - The model to run and the metadata sent with the scan.
///
/// # Errors
///
/// [MedRouterError::UnsupportedFileType] when the source is none of the above,
/// [MedRouterError::ModelNotFound] when the server does not know the model,
/// [MedRouterError::Precheck] when the server-side prechecks reject the scan and
/// [MedRouterError::Inference] when the server accepts the upload without returning a request id.
pub async fn post_with_url(
    url: &str,
    key: &str,
    source: &Path,
    params: &InferenceParams,
) -> Result<String, MedRouterError> {
    params.validate()?;
    let kind = SourceKind::from_path(source)?;

    // The temporary directory must outlive the upload.
    let (upload_path, _workdir) = match kind {
        SourceKind::DicomFolder => {
            let folder = source.to_path_buf();
            let (zip_path, workdir) =
                tokio::task::spawn_blocking(move || zip_dicom_folder(&folder)).await??;
            (zip_path, Some(workdir))
        }
        SourceKind::Nifti | SourceKind::DicomZip => (source.to_path_buf(), None),
    };

    let form = build_form(&upload_path, kind, params).await?;

    let client = authorized_client(key)?;

    info!(
        "Uploading {} for model {} ({})",
        source.display(),
        params.model,
        params.model_id
    );

    let start = std::time::Instant::now();

    let response = client
        .post(inference_endpoint(url))
        .multipart(form)
        .send()
        .await?;

    debug!("Time to post {} : {:?}", source.display(), start.elapsed());

    let response = ensure_success(
        response,
        Endpoint::Upload {
            model: &params.model,
        },
    )
    .await?;

    let body: Value = response.json().await?;
    let request_id = request_id_from(&body).ok_or_else(|| {
        MedRouterError::Inference("upload succeeded but no request_id was returned".to_string())
    })?;

    info!("Upload OK, request_id = {}", request_id);

    Ok(request_id)
}

/// Builds the multipart form: the scan streamed from disk in the `file` part, the
/// metadata as text fields.
async fn build_form(
    path: &Path,
    kind: SourceKind,
    params: &InferenceParams,
) -> Result<multipart::Form, MedRouterError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let file = File::open(path).await?;
    let length = file.metadata().await?.len();
    let stream = FramedRead::new(file, BytesCodec::new());
    let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), length)
        .file_name(file_name)
        .mime_str(kind.mime())?;

    let mut form = multipart::Form::new().part("file", part);
    for (name, value) in params.form_fields() {
        form = form.text(name, value);
    }
    Ok(form)
}

/// The server returns the id either as a string or as a number.
fn request_id_from(body: &Value) -> Option<String> {
    match body.get("request_id")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Zips every DICOM file found under `folder` into a fresh temporary directory.
///
/// Files which cannot be read as DICOM are skipped. Returns the path of the archive and the
/// directory holding it, which is deleted when dropped.
fn zip_dicom_folder(folder: &Path) -> Result<(PathBuf, TempDir), MedRouterError> {
    let workdir = tempfile::tempdir()?;
    let zip_path = workdir.path().join("dicom.zip");

    let mut zip = ZipWriter::new(fs::File::create(&zip_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    for entry in WalkDir::new(folder).into_iter() {
        let entry = match entry {
            Ok(entry) if entry.file_type().is_file() => entry,
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping an entry of {}: {}", folder.display(), e);
                continue;
            }
        };
        let path = entry.path();
        // open the file until the PixelData tag
        if let Err(e) = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
        {
            warn!("Skipping {}: not a valid DICOM file ({})", path.display(), e);
            continue;
        }

        let name = path
            .strip_prefix(folder)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        zip.start_file(name, options)?;
        io::copy(&mut fs::File::open(path)?, &mut zip)?;
        count += 1;
    }

    zip.finish()?.flush()?;

    if count == 0 {
        return Err(MedRouterError::UnsupportedFileType(folder.to_path_buf()));
    }

    info!(
        "{} DICOM file(s) from {} added to the archive.",
        count,
        folder.display()
    );

    Ok((zip_path, workdir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn write_dicom(path: &Path) {
        let mut object = InMemDicomObject::new_empty();
        object.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^John"),
        ));
        let file = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                    .media_storage_sop_instance_uid("2.25.1234"),
            )
            .unwrap();
        file.write_to_file(path).unwrap();
    }

    fn nifti_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("scan.nii.gz");
        fs::write(&path, b"not really a volume").unwrap();
        path
    }

    #[test]
    fn test_request_id_from() {
        assert_eq!(
            Some("abc".to_string()),
            request_id_from(&json!({ "request_id": "abc" }))
        );
        assert_eq!(
            Some("42".to_string()),
            request_id_from(&json!({ "request_id": 42 }))
        );
        assert_eq!(None, request_id_from(&json!({ "request_id": "" })));
        assert_eq!(None, request_id_from(&json!({ "status": "ok" })));
    }

    #[test]
    fn test_zip_dicom_folder_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("series")).unwrap();
        write_dicom(&dir.path().join("series").join("CT000001.dcm"));
        fs::write(dir.path().join("README.txt"), b"hello").unwrap();

        let (zip_path, _workdir) = zip_dicom_folder(dir.path()).unwrap();

        let archive = zip::ZipArchive::new(fs::File::open(zip_path).unwrap()).unwrap();
        assert_eq!(1, archive.len());
        assert_eq!(
            vec!["series/CT000001.dcm"],
            archive.file_names().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_zip_dicom_folder_without_dicom() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        assert!(matches!(
            zip_dicom_folder(dir.path()),
            Err(MedRouterError::UnsupportedFileType(_))
        ));
    }

    #[test]
    fn test_zip_dicom_folder_walk_error_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");

        assert!(matches!(
            zip_dicom_folder(&missing),
            Err(MedRouterError::UnsupportedFileType(path)) if *path == missing
        ));
    }

    #[tokio::test]
    async fn test_post_returns_request_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference/use/"))
            .and(header("Authorization", "secret"))
            .and(body_string_contains("total-segmentator"))
            .and(body_string_contains("scan.nii.gz"))
            .and(body_string_contains("name=\"extra_output_type\"\r\n\r\nply"))
            .and(body_string_contains("name=\"prechecks\"\r\n\r\ntrue"))
            .and(body_string_contains("name=\"notes\"\r\n\r\nliver lesion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "request_id": 17 })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = nifti_file(&dir);
        let mut params = InferenceParams::new("total-segmentator", 570);
        params.extra_output_type = Some(crate::ExtraOutputType::Ply);
        params.prechecks = true;
        params.notes = "liver lesion".to_string();

        let request_id = post_with_url(&server.uri(), "secret", &source, &params)
            .await
            .unwrap();
        assert_eq!("17", request_id);
    }

    #[tokio::test]
    async fn test_post_without_request_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference/use/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "ok" })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = nifti_file(&dir);
        let params = InferenceParams::new("total-segmentator", 570);

        assert!(matches!(
            post_with_url(&server.uri(), "secret", &source, &params).await,
            Err(MedRouterError::Inference(_))
        ));
    }

    #[tokio::test]
    async fn test_post_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference/use/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = nifti_file(&dir);
        let params = InferenceParams::new("no-such-model", 1);

        assert!(matches!(
            post_with_url(&server.uri(), "secret", &source, &params).await,
            Err(MedRouterError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_post_rejects_unsupported_file_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scan.png");
        fs::write(&source, b"png").unwrap();
        let params = InferenceParams::new("total-segmentator", 570);

        assert!(matches!(
            post_with_url(&server.uri(), "secret", &source, &params).await,
            Err(MedRouterError::UnsupportedFileType(_))
        ));
    }

    #[tokio::test]
    async fn test_post_dicom_folder_is_zipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/inference/use/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "request_id": "r-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        write_dicom(&dir.path().join("CT000001.dcm"));
        let params = InferenceParams::new("total-segmentator", 570);

        let request_id = post_with_url(&server.uri(), "secret", dir.path(), &params)
            .await
            .unwrap();
        assert_eq!("r-1", request_id);

        // the archive is not valid UTF-8, look for the part's file name in the raw bytes
        let requests = server.received_requests().await.unwrap();
        let needle = b"filename=\"dicom.zip\"";
        assert!(requests[0]
            .body
            .windows(needle.len())
            .any(|window| window == needle));
    }
}
