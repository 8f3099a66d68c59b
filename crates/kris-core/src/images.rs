use std::path::Path;

use tracing::{debug, info};

use crate::api::JobClass;
use crate::bridge::require_complete;
use crate::cache::ImageCache;
use crate::error::Result;
use crate::staging::Stager;

/// Builds job images from requirements files, memoised by file content.
pub struct ImageBuilder<'a> {
    stager: &'a Stager<'a>,
    cache: &'a ImageCache,
    base_image: &'a str,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(stager: &'a Stager<'a>, cache: &'a ImageCache, base_image: &'a str) -> Self {
        Self {
            stager,
            cache,
            base_image,
        }
    }

    /// Returns the image built from `requirements`, building it only when no
    /// image was built from identical content before.
    pub async fn build(&self, requirements: &Path) -> Result<String> {
        if let Some(image) = self.cache.lookup(requirements)? {
            debug!(image, "image found in cache");
            return Ok(image);
        }

        let remote = self.stager.stage(requirements).await?;
        let client = self.stager.remote().client();
        let started = client.build_image(self.base_image, &remote).await?;
        info!(job = %started.job_name, image = %started.image, "building image");

        let status = client
            .wait_for_job(&started.job_name, JobClass::Service)
            .await?;
        require_complete(&status)?;

        self.cache.put(requirements, started.image.clone())?;
        Ok(started.image)
    }
}
