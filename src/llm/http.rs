use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, trace};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::llm::{ChatBackend, ChatMessage};

/// Settings for an OpenAI-compatible chat-completions server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Base URL, e.g. `http://localhost:1234`.
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1234".into(),
            model: "local-model".into(),
            temperature: 0.8,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

pub struct HttpBackend {
    client: Client,
    url: String,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        let url = completions_url(&config.endpoint);
        info!("Using chat endpoint {url} (model {})", config.model);
        Ok(Self {
            client,
            url,
            config,
        })
    }
}

impl ChatBackend for HttpBackend {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let req = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
        };

        let resp: ChatCompletionResponse = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()
            .context("chat endpoint returned an error status")?
            .json()
            .context("chat endpoint returned malformed JSON")?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("chat endpoint returned no choices")?;

        trace!("=== RAW REPLY ===\n{content}\n=== END REPLY ===");
        Ok(content)
    }
}

fn completions_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_accepts_partial_endpoints() {
        assert_eq!(
            completions_url("http://localhost:1234"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_matches_chat_completions_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let req = ChatCompletionRequest {
            model: "local-model",
            messages: &messages,
            temperature: 0.5,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "local-model");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "hi");
    }
}
