//! Oracle collaborator (§4.5 step 3, §4.6): an optional OpenAI-compatible
//! chat-completion call that turns SQL text, schema context and the
//! historically best-performing recommendation kinds into a structured set
//! of findings. Grounded on `services/llm/client.rs`'s `LLMClient` — same
//! request/response shapes, same Bearer-auth + `response_format: json_object`
//! call, same timeout/rate-limit classification — generalized from a
//! provider-row-driven client into one configured straight from
//! `OracleConfig`, since this core has no multi-provider admin surface.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::analyzer::schema::SchemaContext;
use crate::config::OracleConfig;
use crate::models::{Recommendation, TopRecommendation};
use crate::utils::LruCache;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle disabled")]
    Disabled,
    #[error("oracle request error: {0}")]
    Request(String),
    #[error("oracle timed out after {0}s")]
    Timeout(u64),
    #[error("oracle rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("oracle response parse error: {0}")]
    Parse(String),
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Timeout(_) | OracleError::RateLimited(_) | OracleError::Request(_))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// The oracle's structured verdict, deserialized straight out of the chat
/// completion's JSON content (§4.5 step 3: "problem, root cause, ranked
/// recommendations").
#[derive(Debug, Clone, Deserialize)]
pub struct OracleVerdict {
    pub problem: String,
    pub root_cause: String,
    pub recommendations: Vec<Recommendation>,
}



#[derive(Serialize)]
struct OraclePrompt<'a> {
    sql: &'a str,
    plan: Option<&'a str>,
    tables: Vec<PromptTable<'a>>,
    unresolved_tables: &'a [String],
    historically_confirmed_recommendations: &'a [TopRecommendation],
}

#[derive(Serialize)]
struct PromptTable<'a> {
    name: &'a str,
    columns: &'a [String],
    indexed_columns: &'a [String],
    row_estimate: Option<i64>,
}

const SYSTEM_PROMPT: &str = "You are a database performance analyst. Given a slow SQL \
    statement, its execution plan if available, and the schema of the tables it touches, \
    identify the problem, the most likely root cause, and concrete, actionable \
    recommendations. Prefer recommendation kinds that have historically been confirmed \
    effective for this workload when they apply. Respond with a JSON object containing \
    exactly the fields: problem, root_cause, recommendations (an array of objects with \
    kind, priority, description, sql, rationale, estimated_impact).";

pub struct OracleClient {
    http: Client,
    config: OracleConfig,
    cache: LruCache<String, OracleVerdict>,
}

impl OracleClient {
    pub fn new(config: OracleConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build oracle HTTP client");
        let cache = LruCache::new(config.response_cache_size);
        Self { http, config, cache }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Consults the oracle for `sql`, returning a structured verdict.
    /// Responses are cached per (sql, schema) so repeated observations of
    /// the same fingerprint within the cache TTL don't re-spend tokens
    /// (§5: bounded, LRU, default 1024 entries).
    pub async fn consult(
        &self,
        sql: &str,
        plan: Option<&str>,
        schema: &SchemaContext,
        top_recommendations: &[TopRecommendation],
    ) -> Result<OracleVerdict, OracleError> {
        if !self.config.enabled {
            return Err(OracleError::Disabled);
        }

        let cache_key = cache_key(sql, schema);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| OracleError::Request("oracle enabled but no api_key configured".into()))?;

        let prompt = build_prompt(sql, plan, schema, top_recommendations);
        let user_content = serde_json::to_string_pretty(&prompt)
            .map_err(|e| OracleError::Request(format!("failed to serialize prompt: {e}")))?;

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage { role: "system".into(), content: SYSTEM_PROMPT.into() },
                ChatMessage { role: "user".into(), content: user_content },
            ],
            max_tokens: Some(2048),
            temperature: Some(0.2),
            response_format: Some(ResponseFormat { r#type: "json_object".into() }),
        };

        let response = self
            .http
            .post(&self.config.base_url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout(self.config.timeout_secs)
                } else {
                    OracleError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(OracleError::RateLimited(retry_after));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Request(format!("oracle returned {status}: {body}")));
        }

        let chat_response: ChatCompletionResponse =
            response.json().await.map_err(|e| OracleError::Parse(e.to_string()))?;
        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| OracleError::Parse("empty choices in oracle response".into()))?;

        let verdict: OracleVerdict = serde_json::from_str(content)
            .map_err(|e| OracleError::Parse(format!("{e}: {content}")))?;

        self.cache.insert(cache_key, verdict.clone());
        Ok(verdict)
    }
}

fn cache_key(sql: &str, schema: &SchemaContext) -> String {
    let table_sig: String =
        schema.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(",");
    format!("{sql}|{table_sig}")
}

fn build_prompt<'a>(
    sql: &'a str,
    plan: Option<&'a str>,
    schema: &'a SchemaContext,
    top_recommendations: &'a [TopRecommendation],
) -> OraclePrompt<'a> {
    OraclePrompt {
        sql,
        plan,
        tables: schema
            .tables
            .iter()
            .map(|t| PromptTable {
                name: &t.name,
                columns: &t.columns,
                indexed_columns: &t.indexed_columns,
                row_estimate: t.row_estimate,
            })
            .collect(),
        unresolved_tables: &schema.unresolved,
        historically_confirmed_recommendations: top_recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_client_reports_enabled_false() {
        let client = OracleClient::new(OracleConfig { enabled: false, ..OracleConfig::default() });
        assert!(!client.enabled());
    }

    #[test]
    fn builds_prompt_with_schema_and_history() {
        let schema = SchemaContext {
            tables: vec![crate::analyzer::schema::TableInfo {
                name: "orders".into(),
                columns: vec!["id".into()],
                indexed_columns: vec![],
                row_estimate: Some(1000),
            }],
            unresolved: vec!["ghost_table".into()],
        };
        let history = vec![TopRecommendation {
            kind: "missing_index".into(),
            sample_description: "add index".into(),
            mean_gain_ratio: 0.6,
            confirmed_count: 5,
        }];
        let prompt = build_prompt("SELECT 1", None, &schema, &history);
        assert_eq!(prompt.tables.len(), 1);
        assert_eq!(prompt.unresolved_tables.len(), 1);
        assert_eq!(prompt.historically_confirmed_recommendations.len(), 1);
    }
}
