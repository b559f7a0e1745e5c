use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::gateway::ApiGateway;
use crate::models::{CredentialUsage, LlmExtraction, Report};

/// Generative validation and detail extraction for one report.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, token: &str, report: &Report) -> Result<LlmExtraction, GatewayError>;
}

/// Extractor pinned to a credential rotation.
pub struct ExtractionStage {
    extractor: Box<dyn Extractor>,
    gateway: ApiGateway,
}

impl ExtractionStage {
    pub fn new(extractor: Box<dyn Extractor>, gateway: ApiGateway) -> Self {
        Self { extractor, gateway }
    }

    pub async fn extract(&mut self, report: &Report) -> Result<LlmExtraction, GatewayError> {
        let extractor = self.extractor.as_ref();
        self.gateway
            .call_with_resilience(|token| async move { extractor.extract(&token, report).await })
            .await
    }

    pub fn quota_exhausted(&self) -> bool {
        self.gateway.all_exhausted()
    }

    pub fn usage(&self) -> Vec<CredentialUsage> {
        self.gateway.usage()
    }
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct ChatExtractor {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl ChatExtractor {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build extraction HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Extractor for ChatExtractor {
    async fn extract(&self, token: &str, report: &Report) -> Result<LlmExtraction, GatewayError> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [{"role": "user", "content": build_prompt(report)}],
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GatewayError::Malformed("no choices in response".into()))?;

        parse_extraction(&content)
    }
}

fn build_prompt(report: &Report) -> String {
    let (predicted, confidence) = report
        .ml_classification
        .as_ref()
        .map(|ml| (ml.disaster_type.as_deref().unwrap_or("unknown"), ml.confidence))
        .unwrap_or(("unknown", 0.0));

    format!(
        "Verify whether this post describes a current natural disaster and extract details. \
         Return only JSON with keys llm_classification, disaster_type, location, time, severity \
         (low|medium|high|critical), casualties_mentioned, damage_mentioned, needs_help, key_details.\n\n\
         Post: \"{}\"\nClassifier prediction: {} ({:.2})",
        report.text, predicted, confidence
    )
}

/// Pull the JSON object out of a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_extraction(content: &str) -> Result<LlmExtraction, GatewayError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let object = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(GatewayError::Malformed(
                "no JSON object in model reply".into(),
            ))
        }
    };
    serde_json::from_str(object).map_err(|e| GatewayError::Malformed(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::models::Severity;

    /// Extractor fake that confirms every report. Each token runs out of
    /// quota after `quota_after` successful calls.
    #[derive(Clone, Default)]
    pub struct FakeExtractor {
        pub calls: Arc<AtomicUsize>,
        pub per_token: Arc<Mutex<HashMap<String, usize>>>,
        pub quota_after: Option<usize>,
        pub location: String,
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, token: &str, _report: &Report) -> Result<LlmExtraction, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut per_token = self.per_token.lock().unwrap();
                let used = per_token.entry(token.to_string()).or_default();
                if self.quota_after.is_some_and(|limit| *used >= limit) {
                    return Err(GatewayError::Quota("402 Payment Required".into()));
                }
                *used += 1;
            }
            Ok(LlmExtraction {
                confirmed: true,
                disaster_type: Some("flood".into()),
                location_text: Some(self.location.clone()),
                severity: Severity::High,
                ..Default::default()
            })
        }
    }

    #[test]
    fn parses_fenced_reply() {
        let reply = "```json\n{\"llm_classification\": true, \"location\": \"Valencia, Spain\", \
                     \"severity\": \"high\", \"needs_help\": true}\n```";
        let extraction = parse_extraction(reply).unwrap();
        assert!(extraction.confirmed);
        assert_eq!(extraction.location_text.as_deref(), Some("Valencia, Spain"));
        assert_eq!(extraction.severity, Severity::High);
        assert!(extraction.needs_help);
    }

    #[test]
    fn parses_reply_wrapped_in_prose() {
        let reply = "Sure! Here it is: {\"llm_classification\": false} Hope that helps.";
        assert!(!parse_extraction(reply).unwrap().confirmed);
    }

    #[test]
    fn rejects_reply_without_json() {
        assert!(matches!(
            parse_extraction("I cannot help with that."),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn prompt_carries_classifier_prediction() {
        let report: Report = serde_json::from_str(
            r#"{"id":"1","text":"Water rising fast","createdAt":"2025-01-01T00:00:00Z",
                "ml_classification":{"is_disaster":true,"disaster_type":"flood","confidence":0.87}}"#,
        )
        .unwrap();
        let prompt = build_prompt(&report);
        assert!(prompt.contains("Water rising fast"));
        assert!(prompt.contains("flood (0.87)"));
    }
}
