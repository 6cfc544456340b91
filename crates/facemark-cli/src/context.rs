use crate::config::Config;
use anyhow::{Context, Result};
use facemark_core::GalleryStore;
use std::sync::Arc;

/// Process-wide state handed to every command: configuration and the
/// loaded gallery. Built once in `main`, dropped via [`AppContext::shutdown`].
pub struct AppContext {
    pub config: Config,
    gallery: Arc<GalleryStore>,
}

impl AppContext {
    pub fn init(config: Config) -> Result<Self> {
        let gallery = GalleryStore::load(&config.gallery_path)
            .with_context(|| format!("loading gallery from {}", config.gallery_path.display()))?;
        Ok(Self {
            config,
            gallery: Arc::new(gallery),
        })
    }

    pub fn gallery(&self) -> &Arc<GalleryStore> {
        &self.gallery
    }

    pub fn shutdown(self) {
        tracing::debug!(
            gallery = %self.config.gallery_path.display(),
            entries = self.gallery.len(),
            "context shut down"
        );
    }
}
