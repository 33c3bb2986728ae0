//! Ollama client for summaries, tags and embeddings.
//!
//! Endpoints:
//! - POST /api/generate (JSON mode) for summary, tag and reminder time
//! - POST /api/embed, falling back to the legacy /api/embeddings
//! - GET /api/tags for health checks

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Enrichment, EnrichmentAdapter, EnrichmentError};

/// Ollama HTTP client
pub struct OllamaClient {
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Embedding response; /api/embed returns `embeddings`, the legacy endpoint `embedding`
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// What the model is asked to return
#[derive(Debug, Deserialize)]
struct ModelReply {
    summary: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: embedding_model.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(self.url(path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn api_error(response: reqwest::Response) -> EnrichmentError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(text);
        EnrichmentError::Api { status, message }
    }
}

#[async_trait]
impl EnrichmentAdapter for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn summarize_and_tag(
        &self,
        text: &str,
        allowed_tags: &[String],
    ) -> Result<Enrichment, EnrichmentError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(text, allowed_tags, Local::now()),
            stream: false,
            format: "json",
        };

        let response = self.post("/api/generate").json(&request).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body: GenerateResponse = response.json().await?;
        debug!(model = %self.model, "Generate response received");
        decode_reply(&body.response, allowed_tags)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EnrichmentError> {
        let mut response = self
            .post("/api/embed")
            .json(&serde_json::json!({ "model": self.embedding_model, "input": text }))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            let body = response.text().await.unwrap_or_default();
            if body.contains("page not found") {
                info!("Falling back to legacy /api/embeddings endpoint");
                response = self
                    .post("/api/embeddings")
                    .json(&serde_json::json!({ "model": self.embedding_model, "prompt": text }))
                    .send()
                    .await?;
            } else {
                let message = serde_json::from_str::<ErrorBody>(&body)
                    .map(|b| b.error)
                    .unwrap_or(body);
                if message.to_lowercase().contains("not found") {
                    return Err(EnrichmentError::ModelNotFound(self.embedding_model.clone()));
                }
                return Err(EnrichmentError::Api {
                    status: 404,
                    message,
                });
            }
        }

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body: EmbedResponse = response.json().await?;
        let vector = body
            .embeddings
            .into_iter()
            .next()
            .unwrap_or(body.embedding);

        if vector.is_empty() {
            return Err(EnrichmentError::EmptyEmbedding);
        }
        debug!(model = %self.embedding_model, dim = vector.len(), "Embedding generated");
        Ok(vector)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let mut request = self.client.get(self.url("/api/tags"));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach Ollama at {}", self.base_url))?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama health check failed: {}", response.status());
        }
        Ok(())
    }
}

fn build_prompt(transcript: &str, allowed_tags: &[String], now: DateTime<Local>) -> String {
    format!(
        r#"Current local time: {now}

Read the note below and answer with a single JSON object:
{{
  "summary": "at most five words",
  "tag": "exactly one of: {tags}",
  "timestamp": "YYYY-MM-DDTHH:MM:SS when the author wants a reminder, or null"
}}

Only set "timestamp" when the note asks for a reminder or names a time
("in 20 minutes", "Saturday 2 AM"); resolve it against the current time.

Note: {transcript}"#,
        now = now.format("%Y-%m-%d %H:%M:%S"),
        tags = allowed_tags.join(", "),
        transcript = transcript,
    )
}

/// Decode the model's JSON reply into an [`Enrichment`].
///
/// Anything that is not the expected object, or has an empty summary, is a
/// parse failure. The tag is matched case-insensitively against the allowed
/// set and dropped when unknown; an unreadable timestamp means no reminder.
pub fn decode_reply(raw: &str, allowed_tags: &[String]) -> Result<Enrichment, EnrichmentError> {
    let reply: ModelReply = serde_json::from_str(raw.trim())
        .map_err(|e| EnrichmentError::Parse(format!("{} in {:?}", e, truncate(raw, 120))))?;

    let summary = reply.summary.trim().to_string();
    if summary.is_empty() {
        return Err(EnrichmentError::Parse("model returned an empty summary".to_string()));
    }

    let tag = reply.tag.and_then(|tag| {
        let matched = allowed_tags
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(tag.trim()))
            .cloned();
        if matched.is_none() {
            warn!(%tag, "Model picked a tag outside the allowed set");
        }
        matched
    });

    let notify_at = reply.timestamp.as_deref().and_then(parse_timestamp);

    Ok(Enrichment {
        summary,
        tag,
        notify_at,
    })
}

/// Parse a model-proposed reminder time; naive times are local
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc));
        }
    }

    warn!(timestamp = raw, "Failed to parse reminder timestamp");
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<String> {
        vec!["Idea".to_string(), "Todo".to_string(), "Work".to_string()]
    }

    #[test]
    fn test_decode_full_reply() {
        let raw = r#"{"summary":"Buy milk","tag":"todo","timestamp":"2030-01-02T03:04:05Z"}"#;
        let enrichment = decode_reply(raw, &tags()).unwrap();

        assert_eq!(enrichment.summary, "Buy milk");
        assert_eq!(enrichment.tag.as_deref(), Some("Todo"));
        assert_eq!(
            enrichment.notify_at,
            Some(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap())
        );
    }

    #[test]
    fn test_unknown_tag_is_dropped() {
        let raw = r#"{"summary":"Groceries","tag":"shopping","timestamp":null}"#;
        let enrichment = decode_reply(raw, &tags()).unwrap();
        assert_eq!(enrichment.tag, None);
        assert_eq!(enrichment.notify_at, None);
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let err = decode_reply("Sure! Here is the summary: buy milk", &tags()).unwrap_err();
        assert!(matches!(err, EnrichmentError::Parse(_)));
    }

    #[test]
    fn test_empty_summary_is_a_parse_error() {
        let err = decode_reply(r#"{"summary":"  ","tag":"Idea"}"#, &tags()).unwrap_err();
        assert!(matches!(err, EnrichmentError::Parse(_)));
    }

    #[test]
    fn test_timestamp_variants() {
        assert_eq!(parse_timestamp("null"), None);
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("next tuesday"), None);
        assert!(parse_timestamp("2030-05-06T07:08:09").is_some());
        assert!(parse_timestamp("2030-05-06 07:08:09").is_some());
        assert_eq!(
            parse_timestamp("2030-05-06T07:08:09+02:00"),
            Some(Utc.with_ymd_and_hms(2030, 5, 6, 5, 8, 9).unwrap())
        );
    }

    #[test]
    fn test_prompt_lists_tags() {
        let prompt = build_prompt("call mom", &tags(), Local::now());
        assert!(prompt.contains("Idea, Todo, Work"));
        assert!(prompt.contains("call mom"));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = OllamaClient::new("http://localhost:11434/", "llama3", "nomic", None);
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
        assert_eq!(client.name(), "ollama");
    }
}
