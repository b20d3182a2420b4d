//! HTTP clients for the host platform and the feature extraction service.
//!
//! Both speak JSON. Deadlines and cancellation are applied by the caller's
//! `CallContext`, so the clients carry no timeouts of their own.

use async_trait::async_trait;
use contentdb_core::{
    Error, ExtractionRequest, FeatureExtractor, FeatureRow, FeatureTable, HostPlatform, ImageInfo,
    ImageRef, Result,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

fn upstream(context: &str, e: reqwest::Error) -> Error {
    Error::Upstream(format!("{}: {}", context, e))
}

async fn decode<T: DeserializeOwned>(context: &str, response: Response) -> Result<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(context.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Upstream(format!("{}: HTTP {} {}", context, status, body)));
    }
    response.json().await.map_err(|e| upstream(context, e))
}

fn base(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

#[derive(Serialize)]
struct DescribeRequest<'a> {
    image_ids: &'a [u64],
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

pub struct HttpHost {
    client: Client,
    base_url: String,
}

impl HttpHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base(base_url),
        }
    }
}

#[async_trait]
impl HostPlatform for HttpHost {
    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        let url = format!("{}/images", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream("list images", e))?;
        decode("list images", response).await
    }

    async fn describe_images(&self, image_ids: &[u64]) -> Result<HashMap<u64, ImageInfo>> {
        let url = format!("{}/images/describe", self.base_url);
        debug!("Describing {} images", image_ids.len());
        let response = self
            .client
            .post(&url)
            .json(&DescribeRequest { image_ids })
            .send()
            .await
            .map_err(|e| upstream("describe images", e))?;
        let infos: Vec<ImageInfo> = decode("describe images", response).await?;
        Ok(infos.into_iter().map(|info| (info.image_id, info)).collect())
    }

    async fn container_images(&self, container_id: u64) -> Result<Vec<ImageRef>> {
        let url = format!("{}/containers/{}/images", self.base_url, container_id);
        let context = format!("images of container {}", container_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream(&context, e))?;
        let mut images: Vec<ImageRef> = decode(&context, response).await?;
        images.sort_by_key(|image| image.image_id);
        Ok(images)
    }
}

pub struct HttpExtractor {
    client: Client,
    base_url: String,
}

impl HttpExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base(base_url),
        }
    }

    fn features_url(&self, image_id: u64, featureset: &str) -> String {
        format!("{}/images/{}/features/{}", self.base_url, image_id, featureset)
    }
}

#[async_trait]
impl FeatureExtractor for HttpExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<FeatureRow> {
        let url = format!("{}/extract", self.base_url);
        let context = format!("extract {} on image {}", request.featureset, request.image_id);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| upstream(&context, e))?;
        decode(&context, response).await
    }

    async fn has(&self, image_id: u64, featureset: &str) -> Result<bool> {
        let url = format!("{}/exists", self.features_url(image_id, featureset));
        let context = format!("{} features of image {}", featureset, image_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream(&context, e))?;
        match decode::<ExistsResponse>(&context, response).await {
            Ok(reply) => Ok(reply.exists),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_authoritative(&self, image_id: u64, featureset: &str) -> Result<FeatureTable> {
        let url = self.features_url(image_id, featureset);
        let context = format!("{} features of image {}", featureset, image_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream(&context, e))?;
        decode(&context, response).await
    }
}
