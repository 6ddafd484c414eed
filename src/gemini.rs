//! Streaming client for the Gemini `streamGenerateContent` endpoint.

use std::io::{BufRead, BufReader};

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::refine::{GenerativeBackend, RefineError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
const PLACEHOLDER_KEY: &str = "YOUR_GEMINI_API_KEY";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_output_tokens: 65_536,
            temperature: 0.8,
            top_k: 40,
        }
    }

    pub fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    top_k: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<ChunkContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkContent {
    #[serde(default)]
    parts: Vec<ChunkPart>,
}

#[derive(Debug, Deserialize)]
struct ChunkPart {
    #[serde(default)]
    text: Option<String>,
}

/// Text fragments carried by one server-sent-event line. Lines that are not
/// `data:` events yield nothing.
pub fn parse_sse_line(line: &str) -> Result<Vec<String>, RefineError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(vec![]);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(vec![]);
    }
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    if let Some(err) = chunk.error {
        return Err(RefineError::Api(err.to_string()));
    }
    if let Some(feedback) = &chunk.prompt_feedback {
        debug!(%feedback, "prompt feedback");
    }
    let Some(first) = chunk.candidates.into_iter().next() else {
        return Ok(vec![]);
    };
    if let Some(reason) = &first.finish_reason {
        debug!(finish_reason = %reason, "candidate finished");
    }
    Ok(first
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default())
}

pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Result<Self> {
        let key = cfg.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_KEY {
            bail!("Gemini API key is not set (pass --api-key or set {API_KEY_ENV})");
        }
        let http = Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .context("build http client")?;
        Ok(Self { http, cfg })
    }

    fn request_body<'a>(&self, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [TextPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.cfg.max_output_tokens,
                temperature: self.cfg.temperature,
                top_k: self.cfg.top_k,
            },
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        }
    }
}

impl GenerativeBackend for GeminiClient {
    fn stream_generate(
        &self,
        prompt: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), RefineError> {
        let resp = self
            .http
            .post(self.cfg.stream_url())
            .header("x-goog-api-key", self.cfg.api_key.trim())
            .json(&self.request_body(prompt))
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(RefineError::Status { status, body });
        }
        for line in BufReader::new(resp).lines() {
            for fragment in parse_sse_line(&line?)? {
                on_fragment(&fragment);
            }
        }
        Ok(())
    }
}
