use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gallery_contracts::experiment::ImageInput;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;

/// Raw image bytes plus the MIME type providers need to label them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageBytes {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

pub trait ImageLoader {
    fn load(&self, source: &str) -> Result<ImageBytes>;
}

/// Reads local files or fetches `http(s)://` URLs.
///
/// Relative paths are tried against `base_dir` first, then the working directory.
pub struct SourceImageLoader {
    base_dir: Option<PathBuf>,
    http: HttpClient,
}

impl SourceImageLoader {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            http: HttpClient::new(),
        }
    }

    fn fetch_url(&self, url: &str) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("image download failed ({url}): HTTP {}", status.as_u16());
        }
        let header_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());
        let mime_type = match header_mime {
            Some(mime) => mime,
            None => guess_mime(url_path(url))?.to_string(),
        };
        if !mime_type.starts_with("image/") {
            bail!("URL did not return an image (content-type: {mime_type}): {url}");
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("image download failed ({url})"))?;
        Ok(ImageBytes::new(bytes.to_vec(), mime_type))
    }

    fn resolve_local(&self, source: &str) -> PathBuf {
        let path = PathBuf::from(source);
        if path.is_absolute() {
            return path;
        }
        if let Some(base) = &self.base_dir {
            let candidate = base.join(&path);
            if candidate.is_file() {
                return candidate;
            }
        }
        path
    }

    fn read_local(&self, source: &str) -> Result<ImageBytes> {
        let path = self.resolve_local(source);
        if !path.is_file() {
            bail!("image file not found: {}", path.display());
        }
        let mime_type = guess_mime(&path)?;
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(ImageBytes::new(bytes, mime_type))
    }
}

impl ImageLoader for SourceImageLoader {
    fn load(&self, source: &str) -> Result<ImageBytes> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.fetch_url(source);
        }
        self.read_local(source)
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Known image extensions map to their type; no extension falls back to JPEG.
fn guess_mime(path: impl AsRef<Path>) -> Result<&'static str> {
    let path = path.as_ref();
    if let Some(mime) = mime_for_path(path) {
        return Ok(mime);
    }
    match path.extension() {
        None => Ok("image/jpeg"),
        Some(ext) => bail!(
            "not a recognized image file: {} (extension .{})",
            path.display(),
            ext.to_string_lossy()
        ),
    }
}

fn url_path(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query)
}

/// Loads each image at most once per run; later reads share the bytes.
pub struct ImageCache {
    loader: Box<dyn ImageLoader>,
    entries: HashMap<String, Rc<ImageBytes>>,
}

impl ImageCache {
    pub fn new(loader: Box<dyn ImageLoader>) -> Self {
        Self {
            loader,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, image: &ImageInput) -> Result<Rc<ImageBytes>> {
        if let Some(found) = self.entries.get(&image.source) {
            return Ok(found.clone());
        }
        let loaded = self
            .loader
            .load(&image.source)
            .with_context(|| format!("failed to load image '{}'", image.id))?;
        let loaded = Rc::new(loaded);
        self.entries.insert(image.source.clone(), loaded.clone());
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, source: &str) -> ImageInput {
        ImageInput {
            id: id.to_string(),
            source: source.to_string(),
            caption: None,
        }
    }

    #[test]
    fn local_files_resolve_against_base_dir() -> Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("a.PNG"), [1u8, 2, 3])?;
        let loader = SourceImageLoader::new(Some(temp.path().to_path_buf()));

        let loaded = loader.load("a.PNG")?;
        assert_eq!(loaded.mime_type, "image/png");
        assert_eq!(loaded.bytes, vec![1, 2, 3]);
        assert_eq!(loaded.data_url(), "data:image/png;base64,AQID");
        Ok(())
    }

    #[test]
    fn unknown_and_missing_files_are_errors() -> Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("notes.txt"), "hi")?;
        std::fs::write(temp.path().join("raw"), [0u8])?;
        let loader = SourceImageLoader::new(Some(temp.path().to_path_buf()));

        assert!(loader.load("notes.txt").is_err());
        assert!(loader.load("missing.png").is_err());
        assert_eq!(loader.load("raw")?.mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn url_path_drops_scheme_and_query() {
        assert_eq!(url_path("https://x.test/a/b.webp?size=2"), "x.test/a/b.webp");
        assert_eq!(
            guess_mime(url_path("https://x.test/a/b.webp?size=2")).ok(),
            Some("image/webp")
        );
    }

    #[test]
    fn cache_loads_each_source_once() -> Result<()> {
        let (mut cache, loads) = testing::static_cache();
        let first = cache.get(&image("a", "a.png"))?;
        let again = cache.get(&image("a", "a.png"))?;
        cache.get(&image("b", "b.png"))?;

        assert!(Rc::ptr_eq(&first, &again));
        assert_eq!(*loads.borrow(), vec!["a.png".to_string(), "b.png".to_string()]);
        assert_eq!(cache.len(), 2);
        Ok(())
    }
}
