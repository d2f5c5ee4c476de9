use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use tokio::{fs, io::AsyncWriteExt};

use crate::messages::ImageDescriptor;

/// A stored output image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedImage {
    pub filename: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("no image data or URL provided")]
    MissingData,

    #[error("invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("failed to download from URL: {0}")]
    DownloadStatus(u16),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of persisting one image. A failed save never aborts the batch.
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub filename: String,
    #[serde(serialize_with = "serialize_result")]
    pub result: Result<SavedImage, String>,
}

impl SaveOutcome {
    pub fn saved_path(&self) -> Option<&Path> {
        self.result.as_ref().ok().map(|s| s.path.as_path())
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

fn serialize_result<S: serde::Serializer>(
    result: &Result<SavedImage, String>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    #[serde(rename_all = "snake_case")]
    enum Wire<'a> {
        Saved(&'a SavedImage),
        Error(&'a str),
    }
    match result {
        Ok(saved) => Wire::Saved(saved).serialize(ser),
        Err(e) => Wire::Error(e).serialize(ser),
    }
}

/// Where finished images go.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn save(&self, image: &ImageDescriptor) -> Result<SavedImage, SaveError>;
}

/// Writes images into a directory without overwriting existing files.
pub struct DiskSink {
    out_dir: PathBuf,
    http: reqwest::Client,
}

impl DiskSink {
    pub fn new(out_dir: PathBuf, http: reqwest::Client) -> Self {
        Self { out_dir, http }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    async fn fetch_bytes(&self, image: &ImageDescriptor) -> Result<Vec<u8>, SaveError> {
        if let Some(data) = image.data.as_deref().filter(|d| !d.is_empty()) {
            return Ok(STANDARD.decode(data.trim())?);
        }
        if let Some(url) = image.url.as_deref().filter(|u| !u.is_empty()) {
            let resp = self.http.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(SaveError::DownloadStatus(resp.status().as_u16()));
            }
            return Ok(resp.bytes().await?.to_vec());
        }
        Err(SaveError::MissingData)
    }
}

#[async_trait]
impl ImageSink for DiskSink {
    async fn save(&self, image: &ImageDescriptor) -> Result<SavedImage, SaveError> {
        let bytes = self.fetch_bytes(image).await?;
        fs::create_dir_all(&self.out_dir).await?;

        let path = unique_path(&self.out_dir, &safe_filename(image.filename())).await;
        write_atomic(&path, &bytes).await?;

        let (width, height) = match probe_dimensions(&bytes) {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Image saved");
        Ok(SavedImage {
            filename,
            path,
            width,
            height,
        })
    }
}

/// Save every image, collecting one outcome per descriptor.
pub async fn save_all(sink: &dyn ImageSink, images: &[ImageDescriptor]) -> Vec<SaveOutcome> {
    let mut outcomes = Vec::with_capacity(images.len());
    for image in images {
        let result = sink.save(image).await.map_err(|e| {
            tracing::warn!(filename = image.filename(), error = %e, "Image save failed");
            e.to_string()
        });
        outcomes.push(SaveOutcome {
            filename: image.filename().to_string(),
            result,
        });
    }
    outcomes
}

/// Keep only the last normal path component of a remote-supplied name.
pub fn safe_filename(name: &str) -> String {
    Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .last()
        .unwrap_or_else(|| "output.png".to_string())
}

/// `dir/name.ext`, or `dir/name_N.ext` for the first free `N`.
pub async fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !exists(&candidate).await {
        return candidate;
    }
    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{ext}"));
        if !exists(&candidate).await {
            return candidate;
        }
        counter += 1;
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
    }
    fs::rename(&tmp, path).await
}

fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
