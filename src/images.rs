use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::Client;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::fields::{has_allowed_image_extension, image_extension};
use crate::store::commerce::NewAsset;
use crate::store::{CommerceStore, StoreError};

const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_DIMENSION: u32 = 1200;
const DEFAULT_WEBP_QUALITY: f32 = 85.0;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub media_dir: PathBuf,
    pub max_bytes: u64,
    pub max_width: u32,
    pub max_height: u32,
    pub webp_quality: f32,
    pub jpeg_quality: u8,
    pub prefer_webp: bool,
    pub timeout_secs: u64,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("media"),
            max_bytes: DEFAULT_MAX_BYTES,
            max_width: DEFAULT_MAX_DIMENSION,
            max_height: DEFAULT_MAX_DIMENSION,
            webp_quality: DEFAULT_WEBP_QUALITY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            prefer_webp: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ImageSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            media_dir: std::env::var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_dir),
            max_bytes: env_parsed("IMAGE_MAX_BYTES", defaults.max_bytes),
            max_width: env_parsed("IMAGE_MAX_WIDTH", defaults.max_width),
            max_height: env_parsed("IMAGE_MAX_HEIGHT", defaults.max_height),
            webp_quality: env_parsed("IMAGE_WEBP_QUALITY", defaults.webp_quality),
            jpeg_quality: env_parsed("IMAGE_JPEG_QUALITY", defaults.jpeg_quality),
            prefer_webp: env_parsed("IMAGE_PREFER_WEBP", defaults.prefer_webp),
            timeout_secs: env_parsed("IMAGE_TIMEOUT_SECS", defaults.timeout_secs),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image url has no allowed extension: {0}")]
    DisallowedExtension(String),
    #[error("image download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("image fetch returned HTTP {0}")]
    Status(u16),
    #[error("image exceeds the {max_bytes} byte cap")]
    TooLarge { max_bytes: u64 },
    #[error("image payload failed integrity checks: {0}")]
    Integrity(#[from] image::ImageError),
    #[error("could not persist image: {0}")]
    Persist(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Converted {
    bytes: Vec<u8>,
    extension: String,
    mime: &'static str,
    width: u32,
    height: u32,
}

/// Downloads gallery images, re-encodes them into the preferred format,
/// and registers each as an asset. Assets are keyed by source URL so a
/// re-import never downloads twice.
pub struct ImagePipeline {
    client: Client,
    store: CommerceStore,
    settings: ImageSettings,
}

impl ImagePipeline {
    pub fn new(store: CommerceStore, settings: ImageSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            store,
            settings,
        }
    }

    /// Resolves every URL to an asset id, in order. A URL that fails any
    /// gate is logged and skipped; one bad image never sinks the rest of
    /// the gallery. Duplicate URLs collapse to their first occurrence.
    pub async fn process(&self, urls: &[String], sku: &str) -> Vec<i64> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for url in urls {
            let url = url.trim();
            if url.is_empty() || !seen.insert(url.to_string()) {
                continue;
            }
            match self.resolve(url).await {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(
                        target = "caravel.images",
                        sku, url, error = %err, "image skipped"
                    );
                }
            }
        }
        ids
    }

    /// Asset id for one URL: the already-known asset if the URL was seen
    /// before, otherwise download, re-encode, persist, register.
    async fn resolve(&self, url: &str) -> Result<i64, ImageError> {
        if let Some(existing) = self.store.asset_for_url(url).await? {
            debug!(target = "caravel.images", url, asset_id = existing.id, "asset reused");
            return Ok(existing.id);
        }
        if !has_allowed_image_extension(url) {
            return Err(ImageError::DisallowedExtension(url.to_string()));
        }
        let source_extension = image_extension(url).unwrap_or_else(|| "jpg".to_string());

        let data = self.download(url).await?;
        let decoded = image::load_from_memory(&data)?;
        let converted = self.convert(decoded, &data, &source_extension);

        // The bytes going to disk must decode, whichever path produced them.
        image::load_from_memory(&converted.bytes)?;

        let file_name = format!("{}.{}", Uuid::new_v4(), converted.extension);
        self.persist(&file_name, &converted.bytes).await?;

        let id = self
            .store
            .insert_asset(&NewAsset {
                source_url: url,
                file_name: &file_name,
                mime: converted.mime,
                width: i64::from(converted.width),
                height: i64::from(converted.height),
                byte_len: converted.bytes.len() as i64,
            })
            .await?;
        debug!(
            target = "caravel.images",
            url,
            asset_id = id,
            file = file_name.as_str(),
            "asset stored"
        );
        Ok(id)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status(status.as_u16()));
        }
        if let Some(length) = response.content_length() {
            if length > self.settings.max_bytes {
                return Err(ImageError::TooLarge {
                    max_bytes: self.settings.max_bytes,
                });
            }
        }
        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (data.len() + chunk.len()) as u64 > self.settings.max_bytes {
                return Err(ImageError::TooLarge {
                    max_bytes: self.settings.max_bytes,
                });
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Fits the image inside the configured bounds and re-encodes it as
    /// webp when enabled, else jpeg. If encoding fails the original bytes
    /// are kept untouched. Synchronous on purpose: the webp buffer is not
    /// `Send` and must not live across an await.
    fn convert(&self, decoded: DynamicImage, original: &[u8], source_extension: &str) -> Converted {
        let (source_width, source_height) = (decoded.width(), decoded.height());
        let image = if source_width > self.settings.max_width
            || source_height > self.settings.max_height
        {
            decoded.resize(
                self.settings.max_width,
                self.settings.max_height,
                FilterType::Triangle,
            )
        } else {
            decoded
        };

        if self.settings.prefer_webp {
            if let Ok(encoder) = webp::Encoder::from_image(&image) {
                let encoded = encoder.encode(self.settings.webp_quality);
                return Converted {
                    bytes: encoded.to_vec(),
                    extension: "webp".to_string(),
                    mime: "image/webp",
                    width: image.width(),
                    height: image.height(),
                };
            }
        }

        let rgb = image.to_rgb8();
        let mut cursor = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut cursor, self.settings.jpeg_quality);
        if rgb.write_with_encoder(encoder).is_ok() {
            return Converted {
                bytes: cursor.into_inner(),
                extension: "jpg".to_string(),
                mime: "image/jpeg",
                width: image.width(),
                height: image.height(),
            };
        }

        Converted {
            bytes: original.to_vec(),
            extension: source_extension.to_string(),
            mime: mime_for_extension(source_extension),
            width: source_width,
            height: source_height,
        }
    }

    async fn persist(&self, file_name: &str, bytes: &[u8]) -> Result<(), ImageError> {
        tokio::fs::create_dir_all(&self.settings.media_dir).await?;
        let tmp_path = self.settings.media_dir.join(format!(".{file_name}.tmp"));
        let final_path = self.settings.media_dir.join(file_name);
        if let Err(err) = tokio::fs::write(&tmp_path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ImageError::Persist(err));
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ImageError::Persist(err));
        }
        Ok(())
    }
}

fn mime_for_extension(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([180, 40, 90]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, image::ImageFormat::Png)
            .expect("encode png");
        cursor.into_inner()
    }

    fn settings(dir: &tempfile::TempDir) -> ImageSettings {
        ImageSettings {
            media_dir: dir.path().to_path_buf(),
            ..ImageSettings::default()
        }
    }

    async fn pipeline(settings: ImageSettings) -> (ImagePipeline, CommerceStore) {
        let store = CommerceStore::new(test_pool().await);
        (ImagePipeline::new(store.clone(), settings), store)
    }

    #[tokio::test]
    async fn downloads_converts_and_registers_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/oak-1.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(png_bytes(640, 480), "image/png"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, store) = pipeline(settings(&dir)).await;
        let url = format!("{}/img/oak-1.png", server.uri());

        let first = pipeline.process(&[url.clone()], "DSZ-100").await;
        assert_eq!(first.len(), 1);

        // Second pass resolves from the store, not the network.
        let second = pipeline.process(&[url.clone()], "DSZ-100").await;
        assert_eq!(first, second);

        let asset = store
            .asset_for_url(&url)
            .await
            .expect("lookup")
            .expect("registered");
        assert_eq!(asset.mime, "image/webp");
        assert_eq!(asset.width, 640);
        assert_eq!(asset.height, 480);
        assert!(dir.path().join(&asset.file_name).exists());
    }

    #[tokio::test]
    async fn oversize_payload_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/huge.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 4096], "image/jpeg"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = settings(&dir);
        config.max_bytes = 1024;
        let (pipeline, store) = pipeline(config).await;
        let url = format!("{}/img/huge.jpg", server.uri());

        let ids = pipeline.process(&[url.clone()], "DSZ-100").await;
        assert!(ids.is_empty());
        assert!(store.asset_for_url(&url).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn undecodable_payload_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/fake.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"not an image".to_vec(), "image/png"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, _store) = pipeline(settings(&dir)).await;
        let url = format!("{}/img/fake.png", server.uri());

        let ids = pipeline.process(&[url], "DSZ-100").await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn disallowed_extension_never_hits_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, _store) = pipeline(settings(&dir)).await;
        let url = format!("{}/files/manual.pdf", server.uri());

        let ids = pipeline.process(&[url], "DSZ-100").await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn large_images_are_fit_within_bounds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/wide.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(png_bytes(400, 200), "image/png"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = settings(&dir);
        config.max_width = 100;
        config.max_height = 100;
        let (pipeline, store) = pipeline(config).await;
        let url = format!("{}/img/wide.png", server.uri());

        let ids = pipeline.process(&[url.clone()], "DSZ-100").await;
        assert_eq!(ids.len(), 1);

        let asset = store
            .asset_for_url(&url)
            .await
            .expect("lookup")
            .expect("registered");
        assert_eq!(asset.width, 100);
        assert_eq!(asset.height, 50);
    }

    #[tokio::test]
    async fn jpeg_fallback_applies_when_webp_is_off() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/plain.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(png_bytes(32, 32), "image/png"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = settings(&dir);
        config.prefer_webp = false;
        let (pipeline, store) = pipeline(config).await;
        let url = format!("{}/img/plain.png", server.uri());

        let ids = pipeline.process(&[url.clone()], "DSZ-100").await;
        assert_eq!(ids.len(), 1);

        let asset = store
            .asset_for_url(&url)
            .await
            .expect("lookup")
            .expect("registered");
        assert_eq!(asset.mime, "image/jpeg");
        assert!(asset.file_name.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn duplicate_urls_collapse_within_one_gallery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/one.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(png_bytes(32, 32), "image/png"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let (pipeline, _store) = pipeline(settings(&dir)).await;
        let url = format!("{}/img/one.png", server.uri());

        let ids = pipeline.process(&[url.clone(), url.clone()], "DSZ-100").await;
        assert_eq!(ids.len(), 1);
    }
}
