//! HTTP clients for the external inference services.

use crate::error::CollaboratorError;
use crate::segment::{ConversationState, PageBatch, SegmenterReply, Turn};
use crate::traits::{DocumentSegmenter, Embedder, ModelLoader, PageRenderer, RelevanceScorer};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn parse(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let mut base_url = Url::parse(base_url.trim())?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let api_key = api_key.and_then(|key| {
            let key = key.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });
        Ok(Self {
            base_url,
            api_key,
            timeout,
        })
    }
}

#[derive(Debug, Clone)]
struct RemoteClient {
    name: &'static str,
    client: Client,
    config: RemoteConfig,
}

impl RemoteClient {
    fn new(name: &'static str, config: RemoteConfig) -> Result<Self, CollaboratorError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            name,
            client,
            config,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, CollaboratorError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.config.base_url.join(path)?;
        let mut request = self
            .client
            .post(url.clone())
            .header("content-type", "application/json")
            .json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::BadResponse {
                collaborator: self.name.to_string(),
                details: format!("{url} returned {}", response.status()),
            });
        }
        Ok(response.json().await?)
    }

    fn bad_response(&self, details: impl Into<String>) -> CollaboratorError {
        CollaboratorError::BadResponse {
            collaborator: self.name.to_string(),
            details: details.into(),
        }
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

fn png_base64(client: &RemoteClient, image: &DynamicImage) -> Result<String, CollaboratorError> {
    encode_png(image)
        .map(|png| STANDARD.encode(png))
        .map_err(|error| client.bad_response(format!("cannot encode image: {error}")))
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    remote: RemoteClient,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(config: RemoteConfig, dimensions: usize) -> Result<Self, CollaboratorError> {
        Ok(Self {
            remote: RemoteClient::new("embedder", config)?,
            dimensions,
        })
    }

    fn checked(&self, response: EmbedResponse) -> Result<Vec<f32>, CollaboratorError> {
        if response.embedding.len() != self.dimensions {
            return Err(self.remote.bad_response(format!(
                "embedding has {} dimensions, expected {}",
                response.embedding.len(),
                self.dimensions
            )));
        }
        Ok(response.embedding)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        let response = self
            .remote
            .post("embed", &EmbedRequest {
                text,
                image_base64: None,
            })
            .await?;
        self.checked(response)
    }

    async fn embed_image_text(
        &self,
        image: &DynamicImage,
        text: &str,
    ) -> Result<Vec<f32>, CollaboratorError> {
        let request = EmbedRequest {
            text,
            image_base64: Some(png_base64(&self.remote, image)?),
        };
        let response = self.remote.post("embed", &request).await?;
        self.checked(response)
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
    image_base64: String,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f32,
}

#[derive(Debug, Deserialize)]
struct Ack {}

/// Relevance scorer bound to a model the service has loaded.
pub struct HttpRelevanceScorer {
    remote: RemoteClient,
}

#[async_trait]
impl RelevanceScorer for HttpRelevanceScorer {
    async fn score_relevance(
        &self,
        text: &str,
        image: &DynamicImage,
    ) -> Result<f32, CollaboratorError> {
        let request = ScoreRequest {
            text,
            image_base64: png_base64(&self.remote, image)?,
        };
        let response: ScoreResponse = self.remote.post("score", &request).await?;
        if !(0.0..=1.0).contains(&response.score) {
            return Err(self
                .remote
                .bad_response(format!("score {} outside [0, 1]", response.score)));
        }
        Ok(response.score)
    }
}

/// Asks the scoring service to load its model on acquire and to drop it on release.
pub struct HttpScorerLoader {
    remote: RemoteClient,
}

impl HttpScorerLoader {
    pub fn new(config: RemoteConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            remote: RemoteClient::new("scorer", config)?,
        })
    }
}

#[async_trait]
impl ModelLoader for HttpScorerLoader {
    type Model = HttpRelevanceScorer;

    async fn load(&self) -> Result<HttpRelevanceScorer, CollaboratorError> {
        let _: Ack = self.remote.post("load", &serde_json::json!({})).await?;
        Ok(HttpRelevanceScorer {
            remote: self.remote.clone(),
        })
    }

    fn unload(&self, model: HttpRelevanceScorer) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available to unload the scoring model");
            return;
        };
        runtime.spawn(async move {
            let result: Result<Ack, _> = model.remote.post("unload", &serde_json::json!({})).await;
            if let Err(error) = result {
                warn!(%error, "scoring model unload failed");
            }
        });
    }
}

#[derive(Debug, Serialize)]
struct SegmentPage {
    page_number: u32,
    image_base64: String,
}

#[derive(Debug, Serialize)]
struct SegmentRequest<'a> {
    document_name: &'a str,
    instructions: String,
    first_page: u32,
    total_pages: u32,
    next_chunk_id: u32,
    pages: Vec<SegmentPage>,
    history: &'a [Turn],
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    content: String,
}

pub struct HttpSegmenter {
    remote: RemoteClient,
}

impl HttpSegmenter {
    pub fn new(config: RemoteConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            remote: RemoteClient::new("segmenter", config)?,
        })
    }
}

#[async_trait]
impl DocumentSegmenter for HttpSegmenter {
    async fn segment(
        &self,
        batch: &PageBatch<'_>,
        state: &ConversationState,
    ) -> Result<SegmenterReply, CollaboratorError> {
        let pages = batch
            .pages
            .iter()
            .enumerate()
            .map(|(offset, image)| {
                Ok(SegmentPage {
                    page_number: batch.first_page + offset as u32,
                    image_base64: png_base64(&self.remote, image)?,
                })
            })
            .collect::<Result<Vec<_>, CollaboratorError>>()?;

        let request = SegmentRequest {
            document_name: batch.document_name,
            instructions: batch.instructions(),
            first_page: batch.first_page,
            total_pages: batch.total_pages,
            next_chunk_id: batch.next_chunk_id,
            pages,
            history: state.turns(),
        };
        let response: SegmentResponse = self.remote.post("segment", &request).await?;
        Ok(SegmenterReply {
            content: response.content,
        })
    }
}

#[derive(Debug, Serialize)]
struct RenderRequest {
    pdf_base64: String,
    page_number: u32,
    dpi: u32,
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    image_base64: String,
}

pub struct HttpPageRenderer {
    remote: RemoteClient,
}

impl HttpPageRenderer {
    pub fn new(config: RemoteConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            remote: RemoteClient::new("renderer", config)?,
        })
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn render_page(
        &self,
        document: &[u8],
        page_number: u32,
        dpi: u32,
    ) -> Result<DynamicImage, CollaboratorError> {
        let request = RenderRequest {
            pdf_base64: STANDARD.encode(document),
            page_number,
            dpi,
        };
        let response: RenderResponse = self.remote.post("render", &request).await?;
        let bytes = STANDARD
            .decode(response.image_base64.trim())
            .map_err(|error| self.remote.bad_response(format!("image is not base64: {error}")))?;
        image::load_from_memory(&bytes)
            .map_err(|error| self.remote.bad_response(format!("undecodable page image: {error}")))
    }
}
