use std::path::{Component, Path, PathBuf};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// URL prefix under which static assets are served.
pub const STATIC_PREFIX: &str = "/static";

/// Directory, relative to the root directory, holding the assets.
pub const STATIC_DIR: &str = "static";

/// Extensions tried, in order, when the requested file does not exist.
const FALLBACK_EXTENSIONS: &[&str] = &["html", "png", "trig", "nq", "ttl", "json", "jsonld", "txt"];

/// Read-only file server for `<root>/static`.
#[derive(Debug, Clone)]
pub struct StaticAssets {
    dir: PathBuf,
}

impl StaticAssets {
    pub fn new(root_directory: &Path) -> Self {
        Self {
            dir: root_directory.join(STATIC_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maps a request path (relative to the prefix) to an existing file.
    ///
    /// Anything but plain path segments is refused, so a request can never
    /// leave the asset directory.
    pub async fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || !relative.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }

        let target = self.dir.join(relative);
        if is_file(&target).await {
            return Some(target);
        }

        let file_name = target.file_name()?.to_str()?.to_owned();
        for ext in FALLBACK_EXTENSIONS {
            let candidate = target.with_file_name(format!("{file_name}.{ext}"));
            if is_file(&candidate).await {
                return Some(candidate);
            }
        }
        None
    }

    pub async fn serve(&self, relative: &str) -> Response {
        let Some(path) = self.resolve(relative).await else {
            return StatusCode::NOT_FOUND.into_response();
        };

        match tokio::fs::read(&path).await {
            Ok(body) => ([(header::CONTENT_TYPE, content_type(&path))], body).into_response(),
            Err(e) => {
                tracing::warn!("Failed to read static asset {}: {}", path.display(), e);
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }
}

/// Content type for an asset. `mime_guess` does not know TriG, so it is
/// set explicitly.
pub fn content_type(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("trig") => "application/trig".to_string(),
        _ => mime_guess::from_path(path).first_or_octet_stream().to_string(),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
