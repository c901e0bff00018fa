//! HTTP-backed content generator
//!
//! Speaks JSON to an external content service:
//!
//! | Step     | Endpoint         | Response              |
//! |----------|------------------|-----------------------|
//! | outline  | `POST /outline`  | `OutlineDraft`        |
//! | chapter  | `POST /chapter`  | `ChapterDraft`        |
//! | review   | `POST /review`   | `ReaderReview`        |
//! | revision | `POST /revise`   | `{"outline": ...}`    |
//!
//! Timeouts, connection failures, `429` and `5xx` responses, and bodies that
//! fail to decode are transient so the engine's retry policy applies. Any
//! other non-success status is a terminal content-generation failure.

use async_trait::async_trait;
use inkwell_engine::config::ContentServiceConfig;
use inkwell_engine::{
    Chapter, ChapterDraft, ChapterPlanEntry, Character, ContentGenerator, EngineError,
    EntrantContext, Outline, OutlineDraft, ReaderComment, ReaderPersona, ReaderReview, Result,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct ChapterRequest<'a> {
    context: &'a EntrantContext,
    number: u32,
    entry: &'a ChapterPlanEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_text: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ChapterView<'a> {
    book_id: &'a str,
    number: u32,
    title: &'a str,
    content: &'a str,
    word_count: u32,
}

#[derive(Debug, Serialize)]
struct ReviewRequest<'a> {
    chapter: ChapterView<'a>,
    persona: &'a ReaderPersona,
}

#[derive(Debug, Serialize)]
struct OutlineView<'a> {
    version: u32,
    characters: &'a [Character],
    chapters: &'a [ChapterPlanEntry],
}

#[derive(Debug, Serialize)]
struct FeedbackView<'a> {
    chapter_number: u32,
    persona: &'a str,
    rating: u8,
    critique: &'a str,
}

#[derive(Debug, Serialize)]
struct ReviseRequest<'a> {
    context: &'a EntrantContext,
    outline: OutlineView<'a>,
    feedback: Vec<FeedbackView<'a>>,
}

#[derive(Debug, Deserialize)]
struct ReviseResponse {
    #[serde(default)]
    outline: Option<OutlineDraft>,
}

pub struct HttpContentGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpContentGenerator {
    pub fn new(cfg: &ContentServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| EngineError::config_with_source("failed to build HTTP client", e))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            EngineError::transient_with_source(format!("request to {url} failed"), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&url, status, &body));
        }

        let text = response.text().await.map_err(|e| {
            EngineError::transient_with_source(format!("failed to read response from {url}"), e)
        })?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::transient_with_source(format!("malformed response from {url}"), e)
        })
    }
}

fn status_error(url: &str, status: StatusCode, body: &str) -> EngineError {
    let message = format!("{url} returned HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EngineError::transient(message)
    } else {
        EngineError::content_generation(message, 1)
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate_outline(&self, ctx: &EntrantContext) -> Result<OutlineDraft> {
        self.post("outline", ctx).await
    }

    async fn write_chapter(
        &self,
        ctx: &EntrantContext,
        number: u32,
        entry: &ChapterPlanEntry,
        prior_text: Option<&str>,
    ) -> Result<ChapterDraft> {
        let body = ChapterRequest {
            context: ctx,
            number,
            entry,
            prior_text,
        };
        self.post("chapter", &body).await
    }

    async fn review_chapter(
        &self,
        chapter: &Chapter,
        persona: &ReaderPersona,
    ) -> Result<ReaderReview> {
        let body = ReviewRequest {
            chapter: ChapterView {
                book_id: &chapter.book_id,
                number: chapter.number,
                title: &chapter.title,
                content: &chapter.content,
                word_count: chapter.word_count,
            },
            persona,
        };
        self.post("review", &body).await
    }

    async fn revise_outline(
        &self,
        ctx: &EntrantContext,
        outline: &Outline,
        feedback: &[ReaderComment],
    ) -> Result<Option<OutlineDraft>> {
        let body = ReviseRequest {
            context: ctx,
            outline: OutlineView {
                version: outline.version,
                characters: &outline.characters,
                chapters: &outline.chapters,
            },
            feedback: feedback
                .iter()
                .map(|c| FeedbackView {
                    chapter_number: c.chapter_number,
                    persona: &c.persona,
                    rating: c.rating,
                    critique: &c.critique,
                })
                .collect(),
        };
        let response: ReviseResponse = self.post("revise", &body).await?;
        Ok(response.outline)
    }
}
