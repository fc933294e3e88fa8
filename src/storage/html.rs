//! On-disk storage of fetched HTML bodies
//!
//! Bodies are written to `<root>/<crawl_id>/<sha256(url)>.html`; the returned
//! path is the `html_ref` carried on `page_fetched` messages.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HtmlStore {
    root: PathBuf,
}

impl HtmlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a page body is stored under
    pub fn path_for(&self, crawl_id: &str, url: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        self.root.join(crawl_id).join(format!("{}.html", digest))
    }

    /// Writes a page body and returns its `html_ref`
    pub async fn save(&self, crawl_id: &str, url: &str, body: &str) -> std::io::Result<String> {
        let path = self.path_for(crawl_id, url);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Reads a body previously written by [`HtmlStore::save`]
    pub async fn load(&self, html_ref: &str) -> std::io::Result<String> {
        tokio::fs::read_to_string(html_ref).await
    }
}
