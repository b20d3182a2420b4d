use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An image known to the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub image_id: u64,
    pub owner_id: u64,
}

/// Host metadata needed to evaluate filters and plan extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub image_id: u64,
    pub owner_id: u64,
    #[serde(default)]
    pub container_ids: Vec<u64>,
    #[serde(default)]
    pub channel_names: Vec<String>,
    #[serde(default = "one")]
    pub size_z: u64,
    #[serde(default = "one")]
    pub size_t: u64,
    #[serde(default)]
    pub pixels_id: u64,
}

fn one() -> u64 {
    1
}

impl ImageInfo {
    pub fn size_c(&self) -> u64 {
        self.channel_names.len() as u64
    }
}

/// The image-management platform the index lives in.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Every image the caller can see.
    async fn list_images(&self) -> Result<Vec<ImageRef>>;

    /// Bulk lookup. Images that no longer exist are absent from the map.
    async fn describe_images(&self, image_ids: &[u64]) -> Result<HashMap<u64, ImageInfo>>;

    /// Images linked into a container, ordered by image id. Hosts with nested
    /// containers (projects holding datasets) should include the images of
    /// every descendant.
    ///
    /// The default scans every visible image, so hosts with a direct lookup
    /// should override it.
    async fn container_images(&self, container_id: u64) -> Result<Vec<ImageRef>> {
        let images = self.list_images().await?;
        let ids: Vec<u64> = images.iter().map(|i| i.image_id).collect();
        let infos = self.describe_images(&ids).await?;
        let mut members: Vec<ImageRef> = images
            .into_iter()
            .filter(|image| {
                infos
                    .get(&image.image_id)
                    .map_or(false, |info| info.container_ids.contains(&container_id))
            })
            .collect();
        members.sort_by_key(|image| image.image_id);
        Ok(members)
    }
}
