//! AIClient - Vision Provider Adapter
//!
//! ## Responsibilities
//!
//! - Send a frame plus the analysis prompt to the configured vision LLM
//! - Parse the reply into description / keywords / confidence
//! - Fall back to heuristic keyword extraction for free-text replies
//! - Provider health checks
//!
//! Providers: OpenAI, Anthropic, Gemini and LM Studio (OpenAI-compatible
//! local server).

use crate::error::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const MAX_OUTPUT_TOKENS: u32 = 500;
const TEMPERATURE: f32 = 0.3;
const MAX_KEYWORDS: usize = 10;

/// Prompt sent with every frame
pub const ANALYSIS_PROMPT: &str = r#"Analise esta imagem de câmera de segurança e descreva o que está acontecendo.

Responda em formato JSON com a seguinte estrutura:
{
    "description": "Descrição detalhada do que está acontecendo na cena",
    "keywords": ["lista", "de", "palavras", "chave", "relevantes"],
    "confidence": 0.95
}

Foque em:
- Pessoas presentes e suas ações
- Veículos e movimentos
- Objetos suspeitos ou incomuns
- Atividades relevantes para segurança
- Condições ambientais (iluminação, clima se visível)

Seja objetivo e preciso. As palavras-chave devem ser termos simples que descrevam os elementos principais da cena.
Responda APENAS com o JSON, sem texto adicional."#;

const STOP_WORDS: &[&str] = &[
    "a", "o", "e", "de", "da", "do", "em", "um", "uma", "para", "com", "que", "na", "no", "se",
    "por", "mais", "como", "mas", "foi", "são", "está", "este", "esta", "esse", "essa", "ao",
    "the", "is", "are", "in", "on", "at", "to", "and", "of",
];

/// Always kept by the fallback extractor, even past the keyword limit
const SECURITY_TERMS: &[&str] = &[
    "pessoa", "pessoas", "homem", "mulher", "criança", "veículo", "carro", "moto", "caminhão",
    "bicicleta", "movimento", "entrando", "saindo", "correndo", "andando", "pacote", "mala",
    "bolsa", "objeto", "noite", "dia", "escuro", "iluminado", "suspeito", "alerta", "perigo",
    "emergência",
];

/// Which provider to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    LmStudio,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::LmStudio => "lmstudio",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            "lmstudio" => Ok(ProviderKind::LmStudio),
            other => Err(Error::Config(format!("Unsupported LLM provider: {}", other))),
        }
    }
}

/// Provider settings, read from the environment by `AppConfig`
#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub provider: ProviderKind,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub lmstudio_api_url: String,
    pub lmstudio_model: String,
    pub request_timeout: Duration,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            anthropic_api_key: None,
            anthropic_model: "claude-sonnet-4-20250514".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-pro-vision".to_string(),
            lmstudio_api_url: "http://localhost:1234/v1".to_string(),
            lmstudio_model: "local-model".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of analysing one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub description: String,
    pub keywords: Vec<String>,
    pub confidence: Option<f32>,
    #[serde(skip_serializing)]
    pub raw_response: Option<String>,
    pub provider: String,
    pub model: String,
    pub processing_time_ms: u64,
}

/// Provider health, as reported by `/api/v1/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub model: String,
    pub healthy: bool,
}

/// HTTP endpoint shared by every provider variant
#[derive(Debug, Clone)]
pub struct Endpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl Endpoint {
    fn new(base_url: &str, api_key: Option<String>, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }

    fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }
}

/// Vision LLM, resolved once at startup
#[derive(Debug, Clone)]
pub enum VisionProvider {
    OpenAi(Endpoint),
    Anthropic(Endpoint),
    Gemini(Endpoint),
    LmStudio(Endpoint),
}

// Reply shapes, reduced to the fields we read

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiReply {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl VisionProvider {
    /// Build the configured provider. Hosted providers need an API key.
    pub fn from_config(settings: &VisionSettings) -> Result<Self> {
        let timeout = settings.request_timeout;
        let require_key = |key: &Option<String>| -> Result<Option<String>> {
            match key {
                Some(k) if !k.trim().is_empty() => Ok(Some(k.clone())),
                _ => Err(Error::Config(format!(
                    "API key not configured for provider {}",
                    settings.provider
                ))),
            }
        };

        let provider = match settings.provider {
            ProviderKind::OpenAi => VisionProvider::OpenAi(Endpoint::new(
                OPENAI_BASE_URL,
                require_key(&settings.openai_api_key)?,
                &settings.openai_model,
                timeout,
            )?),
            ProviderKind::Anthropic => VisionProvider::Anthropic(Endpoint::new(
                ANTHROPIC_BASE_URL,
                require_key(&settings.anthropic_api_key)?,
                &settings.anthropic_model,
                timeout,
            )?),
            ProviderKind::Gemini => VisionProvider::Gemini(Endpoint::new(
                GEMINI_BASE_URL,
                require_key(&settings.gemini_api_key)?,
                &settings.gemini_model,
                timeout,
            )?),
            ProviderKind::LmStudio => VisionProvider::LmStudio(Endpoint::new(
                &settings.lmstudio_api_url,
                None,
                &settings.lmstudio_model,
                timeout,
            )?),
        };

        tracing::info!(
            provider = %provider.kind(),
            model = %provider.model(),
            "Vision provider configured"
        );
        Ok(provider)
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            VisionProvider::OpenAi(_) => ProviderKind::OpenAi,
            VisionProvider::Anthropic(_) => ProviderKind::Anthropic,
            VisionProvider::Gemini(_) => ProviderKind::Gemini,
            VisionProvider::LmStudio(_) => ProviderKind::LmStudio,
        }
    }

    fn endpoint(&self) -> &Endpoint {
        match self {
            VisionProvider::OpenAi(e)
            | VisionProvider::Anthropic(e)
            | VisionProvider::Gemini(e)
            | VisionProvider::LmStudio(e) => e,
        }
    }

    pub fn model(&self) -> &str {
        &self.endpoint().model
    }

    /// Analyse one JPEG frame
    pub async fn analyze(&self, jpeg: &[u8]) -> Result<AnalysisResult> {
        let start = Instant::now();
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(jpeg);

        let text = match self {
            VisionProvider::OpenAi(endpoint) | VisionProvider::LmStudio(endpoint) => {
                self.chat_completion(endpoint, &image_b64).await?
            }
            VisionProvider::Anthropic(endpoint) => self.anthropic_message(endpoint, &image_b64).await?,
            VisionProvider::Gemini(endpoint) => self.gemini_generate(endpoint, &image_b64).await?,
        };

        let (description, keywords, confidence) = parse_response(&text);
        let processing_time_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            provider = %self.kind(),
            keywords = keywords.len(),
            processing_time_ms = processing_time_ms,
            "Frame analysed"
        );

        Ok(AnalysisResult {
            description,
            keywords,
            confidence,
            raw_response: Some(text),
            provider: self.kind().as_str().to_string(),
            model: self.model().to_string(),
            processing_time_ms,
        })
    }

    /// Reachability check. Never errors; failures are logged and reported false.
    pub async fn health_check(&self) -> bool {
        let endpoint = self.endpoint();
        let request = match self {
            VisionProvider::OpenAi(_) => endpoint
                .client
                .get(format!("{}/models", endpoint.base_url))
                .bearer_auth(endpoint.api_key()),
            VisionProvider::LmStudio(_) => endpoint.client.get(format!("{}/models", endpoint.base_url)),
            VisionProvider::Gemini(_) => endpoint
                .client
                .get(format!("{}/models", endpoint.base_url))
                .query(&[("key", endpoint.api_key())]),
            // No cheap health endpoint; a configured key is the best signal
            VisionProvider::Anthropic(_) => return endpoint.api_key.is_some(),
        };

        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::error!(provider = %self.kind(), error = %e, "Vision provider health check failed");
                false
            }
        }
    }

    pub async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            provider: self.kind().as_str().to_string(),
            model: self.model().to_string(),
            healthy: self.health_check().await,
        }
    }

    async fn chat_completion(&self, endpoint: &Endpoint, image_b64: &str) -> Result<String> {
        let body = chat_completion_body(&endpoint.model, image_b64);
        let mut request = endpoint
            .client
            .post(format!("{}/chat/completions", endpoint.base_url))
            .json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        let reply: ChatCompletion = self.checked_json(resp).await?;
        Ok(reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn anthropic_message(&self, endpoint: &Endpoint, image_b64: &str) -> Result<String> {
        let body = anthropic_body(&endpoint.model, image_b64);
        let resp = endpoint
            .client
            .post(format!("{}/messages", endpoint.base_url))
            .header("x-api-key", endpoint.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let reply: AnthropicMessage = self.checked_json(resp).await?;
        Ok(reply.content.into_iter().filter_map(|block| block.text).collect())
    }

    async fn gemini_generate(&self, endpoint: &Endpoint, image_b64: &str) -> Result<String> {
        let body = gemini_body(image_b64);
        let resp = endpoint
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                endpoint.base_url, endpoint.model
            ))
            .query(&[("key", endpoint.api_key())])
            .json(&body)
            .send()
            .await?;

        let reply: GeminiReply = self.checked_json(resp).await?;
        Ok(reply
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn checked_json<T: serde::de::DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(provider = %self.kind(), status = %status, "Vision provider request failed");
            return Err(Error::Api(format!(
                "{} analysis failed: {} - {}",
                self.kind(),
                status,
                body
            )));
        }
        Ok(resp.json().await?)
    }
}

fn chat_completion_body(model: &str, image_b64: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": ANALYSIS_PROMPT },
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:image/jpeg;base64,{}", image_b64),
                        "detail": "low"
                    }
                }
            ]
        }],
        "max_tokens": MAX_OUTPUT_TOKENS,
        "temperature": TEMPERATURE
    })
}

fn anthropic_body(model: &str, image_b64: &str) -> serde_json::Value {
    json!({
        "model": model,
        "max_tokens": MAX_OUTPUT_TOKENS,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": { "type": "base64", "media_type": "image/jpeg", "data": image_b64 }
                },
                { "type": "text", "text": ANALYSIS_PROMPT }
            ]
        }]
    })
}

fn gemini_body(image_b64: &str) -> serde_json::Value {
    json!({
        "contents": [{
            "parts": [
                { "text": ANALYSIS_PROMPT },
                { "inline_data": { "mime_type": "image/jpeg", "data": image_b64 } }
            ]
        }],
        "generationConfig": {
            "maxOutputTokens": MAX_OUTPUT_TOKENS,
            "temperature": TEMPERATURE
        }
    })
}

/// Split a provider reply into `(description, keywords, confidence)`.
///
/// JSON replies (optionally inside a code fence) are read field by field.
/// Anything else becomes the description, with keywords extracted from it.
pub fn parse_response(text: &str) -> (String, Vec<String>, Option<f32>) {
    let mut body = text.trim().to_string();
    if body.starts_with("```") {
        let lines: Vec<&str> = body.lines().collect();
        body = if lines.len() > 2 {
            lines[1..lines.len() - 1].join("\n")
        } else {
            String::new()
        };
    }

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(data)) => {
            let description = data
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| text.to_string());
            let keywords = data
                .get("keywords")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|k| k.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let confidence = data
                .get("confidence")
                .and_then(|v| v.as_f64())
                .map(|c| c as f32);
            (description, keywords, confidence)
        }
        _ => (text.to_string(), extract_keywords(text), None),
    }
}

/// Heuristic keywords from free text
pub fn extract_keywords(text: &str) -> Vec<String> {
    let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let security_terms: HashSet<&str> = SECURITY_TERMS.iter().copied().collect();
    let mut keywords: Vec<String> = Vec::new();

    for raw in text.to_lowercase().split_whitespace() {
        let word: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
        if word.chars().count() <= 2 || stop_words.contains(word.as_str()) {
            continue;
        }
        if (security_terms.contains(word.as_str()) || keywords.len() < MAX_KEYWORDS)
            && !keywords.contains(&word)
        {
            keywords.push(word);
        }
    }

    keywords.truncate(MAX_KEYWORDS);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    #[test]
    fn test_parse_json_reply() {
        let reply = r#"{"description": "Uma pessoa na porta", "keywords": ["pessoa", "porta"], "confidence": 0.9}"#;
        let (description, keywords, confidence) = parse_response(reply);
        assert_eq!(description, "Uma pessoa na porta");
        assert_eq!(keywords, vec!["pessoa", "porta"]);
        assert!((confidence.unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "```json\n{\"description\": \"Carro estacionado\", \"keywords\": [\"carro\"]}\n```";
        let (description, keywords, confidence) = parse_response(reply);
        assert_eq!(description, "Carro estacionado");
        assert_eq!(keywords, vec!["carro"]);
        assert!(confidence.is_none());
    }

    #[test]
    fn test_parse_free_text_falls_back() {
        let reply = "Um homem está andando com uma bolsa.";
        let (description, keywords, confidence) = parse_response(reply);
        assert_eq!(description, reply);
        assert_eq!(keywords, vec!["homem", "andando", "bolsa"]);
        assert!(confidence.is_none());
    }

    #[test]
    fn test_parse_missing_description_uses_raw_text() {
        let reply = r#"{"keywords": ["noite"]}"#;
        let (description, keywords, _) = parse_response(reply);
        assert_eq!(description, reply);
        assert_eq!(keywords, vec!["noite"]);
    }

    #[test]
    fn test_extract_keywords_limit_and_dedup() {
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima alpha";
        let keywords = extract_keywords(text);
        assert_eq!(keywords.len(), MAX_KEYWORDS);
        assert_eq!(keywords[0], "alpha");
        assert!(!keywords.contains(&"kilo".to_string()));
    }

    #[test]
    fn test_extract_keywords_drops_stop_words() {
        let keywords = extract_keywords("The car is on the road, and it's raining!");
        assert_eq!(keywords, vec!["car", "road", "its", "raining"]);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("lmstudio".parse::<ProviderKind>().unwrap(), ProviderKind::LmStudio);
        assert!(matches!("bard".parse::<ProviderKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_config_requires_key() {
        let settings = VisionSettings {
            provider: ProviderKind::Anthropic,
            ..Default::default()
        };
        assert!(matches!(VisionProvider::from_config(&settings), Err(Error::Config(_))));

        let settings = VisionSettings {
            provider: ProviderKind::LmStudio,
            ..Default::default()
        };
        let provider = VisionProvider::from_config(&settings).unwrap();
        assert_eq!(provider.kind(), ProviderKind::LmStudio);
        assert_eq!(provider.model(), "local-model");
    }

    #[test]
    fn test_request_bodies_carry_image() {
        let chat = chat_completion_body("gpt-4o", "AAAA");
        assert_eq!(chat["model"], "gpt-4o");
        assert_eq!(
            chat["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );

        let anthropic = anthropic_body("claude", "AAAA");
        assert_eq!(anthropic["messages"][0]["content"][0]["source"]["data"], "AAAA");

        let gemini = gemini_body("AAAA");
        assert_eq!(gemini["contents"][0]["parts"][1]["inline_data"]["data"], "AAAA");
    }

    #[tokio::test]
    async fn test_analyze_against_local_server() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "llava");
                Json(json!({
                    "choices": [{
                        "message": {
                            "content": "{\"description\": \"Pátio vazio\", \"keywords\": [\"patio\"], \"confidence\": 0.8}"
                        }
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = VisionSettings {
            provider: ProviderKind::LmStudio,
            lmstudio_api_url: format!("http://{}/v1", addr),
            lmstudio_model: "llava".to_string(),
            ..Default::default()
        };
        let provider = VisionProvider::from_config(&settings).unwrap();
        let result = provider.analyze(b"jpeg-bytes").await.unwrap();

        assert_eq!(result.description, "Pátio vazio");
        assert_eq!(result.keywords, vec!["patio"]);
        assert_eq!(result.provider, "lmstudio");
        assert_eq!(result.model, "llava");
    }

    #[tokio::test]
    async fn test_error_status_becomes_api_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = VisionSettings {
            provider: ProviderKind::LmStudio,
            lmstudio_api_url: format!("http://{}/v1", addr),
            ..Default::default()
        };
        let provider = VisionProvider::from_config(&settings).unwrap();
        assert!(matches!(provider.analyze(b"x").await, Err(Error::Api(_))));
        assert!(!provider.health_check().await);
    }
}
