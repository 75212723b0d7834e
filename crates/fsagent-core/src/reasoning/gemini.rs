//! Gemini reasoning client (Generative Language API).
//!
//! Each turn is a series of `generateContent` rounds: the model's parts
//! map 1:1 onto turn events, and pushed tool results become
//! `functionResponse` parts in the next round's request. Conversation
//! history is shared across turns so the assistant keeps context.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::time::timeout;

use super::{ReasoningClient, ReasoningError, ReasoningErrorKind, TurnStream};
use crate::config::{resolve_api_key, resolve_base_url};
use crate::core::events::{ContentBlock, TurnEvent};
use crate::core::session::ConversationSession;
use crate::mcp::ToolCatalog;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Bound on one `generateContent` round-trip. A stalled endpoint fails
/// the turn instead of hanging the orchestrator.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Instruction carried on every request.
const SYSTEM_INSTRUCTION: &str = "Assist the user in navigating and managing their local files. \
     Maintain context across messages.";

/// Gemini API configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl GeminiConfig {
    /// Creates a new config from environment.
    ///
    /// Authentication resolution order: config value, then the
    /// `GEMINI_API_KEY` environment variable. `GEMINI_BASE_URL` overrides
    /// the base URL.
    ///
    /// # Errors
    /// Returns an error when no API key is available.
    pub fn from_env(
        model: String,
        config_api_key: Option<&str>,
        config_base_url: Option<&str>,
    ) -> Result<Self> {
        let api_key = resolve_api_key(config_api_key, "GEMINI_API_KEY", "gemini")?;
        let base_url = resolve_base_url(
            config_base_url,
            "GEMINI_BASE_URL",
            DEFAULT_BASE_URL,
            "Gemini",
        )?;
        Ok(Self {
            api_key,
            base_url,
            model,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }
}

/// Gemini client. Holds the conversation history shared by all turns of
/// one orchestrator instance.
pub struct GeminiClient {
    config: Arc<GeminiConfig>,
    http: reqwest::Client,
    history: Arc<Mutex<Vec<Value>>>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ReasoningClient for GeminiClient {
    type Stream = GeminiTurn;

    async fn begin_turn(
        &self,
        _session: &ConversationSession,
        user_message: &str,
        catalog: &ToolCatalog,
    ) -> Result<GeminiTurn, ReasoningError> {
        push_history(
            &self.history,
            "user",
            vec![json!({"text": user_message})],
        );

        Ok(GeminiTurn {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            tools: build_tools(catalog),
            history: Arc::clone(&self.history),
            queue: VecDeque::new(),
            unanswered: Vec::new(),
            responses: Vec::new(),
            started: false,
            round_had_calls: false,
            done: false,
            call_seq: 0,
        })
    }

    fn reset(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }
}

/// One turn's event sequence over successive `generateContent` rounds.
pub struct GeminiTurn {
    config: Arc<GeminiConfig>,
    http: reqwest::Client,
    tools: Value,
    history: Arc<Mutex<Vec<Value>>>,
    queue: VecDeque<TurnEvent>,
    /// Ids of yielded requests that still lack a pushed result.
    unanswered: Vec<String>,
    /// `functionResponse` parts collected for the next round.
    responses: Vec<Value>,
    started: bool,
    round_had_calls: bool,
    done: bool,
    call_seq: u64,
}

impl TurnStream for GeminiTurn {
    async fn next_event(&mut self) -> Result<Option<TurnEvent>, ReasoningError> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                if let TurnEvent::ToolCallRequest { id, .. } = &event {
                    self.unanswered.push(id.clone());
                }
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            if !self.unanswered.is_empty() {
                return Err(ReasoningError::new(
                    ReasoningErrorKind::Protocol,
                    format!(
                        "stream polled with {} tool result(s) outstanding",
                        self.unanswered.len()
                    ),
                ));
            }

            if !self.started {
                self.started = true;
                self.run_round().await?;
            } else if self.round_had_calls {
                let parts = std::mem::take(&mut self.responses);
                push_history(&self.history, "user", parts);
                self.run_round().await?;
            } else {
                self.done = true;
                return Ok(None);
            }
        }
    }

    fn push_result(&mut self, result: &TurnEvent) -> Result<(), ReasoningError> {
        let TurnEvent::ToolCallResult {
            id,
            name,
            payload,
            is_error,
        } = result
        else {
            return Err(ReasoningError::new(
                ReasoningErrorKind::Protocol,
                "only tool call results can be pushed into the stream",
            ));
        };

        let position = self.unanswered.iter().position(|p| p == id).ok_or_else(|| {
            ReasoningError::new(
                ReasoningErrorKind::Protocol,
                format!("no outstanding tool call with id {id}"),
            )
        })?;
        self.unanswered.remove(position);

        self.responses.push(json!({
            "functionResponse": {
                "name": name,
                "response": {
                    "content": payload_text(payload.as_deref()),
                    "is_error": is_error,
                }
            }
        }));
        Ok(())
    }
}

impl GeminiTurn {
    /// One `generateContent` round: request, record the model content,
    /// queue its parts as events.
    async fn run_round(&mut self) -> Result<(), ReasoningError> {
        let contents = self
            .history
            .lock()
            .map_err(|_| {
                ReasoningError::new(ReasoningErrorKind::Protocol, "history lock poisoned")
            })?
            .clone();
        let request = build_request(&contents, &self.tools, SYSTEM_INSTRUCTION);

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        );
        let send = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send();
        let response = timeout(self.config.request_timeout, send)
            .await
            .map_err(|_| {
                ReasoningError::new(
                    ReasoningErrorKind::Http,
                    format!(
                        "no reply from Gemini within {:?}",
                        self.config.request_timeout
                    ),
                )
            })?
            .map_err(|e| {
                ReasoningError::new(ReasoningErrorKind::Http, "request to Gemini failed")
                    .with_details(e.to_string())
            })?;

        let status = response.status();
        let body: Value = if status.is_success() {
            response.json().await.map_err(|e| {
                ReasoningError::new(ReasoningErrorKind::Protocol, "unparseable Gemini response")
                    .with_details(e.to_string())
            })?
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::new(
                ReasoningErrorKind::Api,
                format!("Gemini returned HTTP {}", status.as_u16()),
            )
            .with_details(body));
        };

        let parts = body["candidates"][0]["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if !parts.is_empty() {
            push_history(&self.history, "model", parts.clone());
        }

        let mut had_calls = false;
        for part in &parts {
            let event = part_to_event(part, &mut self.call_seq)?;
            if matches!(event, TurnEvent::ToolCallRequest { .. }) {
                had_calls = true;
            }
            self.queue.push_back(event);
        }
        self.round_had_calls = had_calls;
        Ok(())
    }
}

fn push_history(history: &Arc<Mutex<Vec<Value>>>, role: &str, parts: Vec<Value>) {
    if let Ok(mut history) = history.lock() {
        history.push(json!({"role": role, "parts": parts}));
    }
}

/// Flattens a tool payload to the text the model is given back.
fn payload_text(payload: Option<&[ContentBlock]>) -> String {
    let Some(blocks) = payload else {
        return String::new();
    };
    blocks
        .iter()
        .map(|b| b.text.as_deref().unwrap_or("(no text)"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds the `tools` value from the discovered catalog.
fn build_tools(catalog: &ToolCatalog) -> Value {
    let declarations: Vec<Value> = catalog
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": sanitize_schema(tool.input_schema.clone()),
            })
        })
        .collect();
    json!([{ "functionDeclarations": declarations }])
}

/// Strips JSON-schema keywords the Gemini API rejects.
fn sanitize_schema(mut schema: Value) -> Value {
    fn strip(value: &mut Value) {
        if let Value::Object(map) = value {
            map.remove("$schema");
            map.remove("additionalProperties");
            for (_, nested) in map.iter_mut() {
                strip(nested);
            }
        } else if let Value::Array(items) = value {
            for item in items.iter_mut() {
                strip(item);
            }
        }
    }
    strip(&mut schema);
    schema
}

fn build_request(contents: &[Value], tools: &Value, system: &str) -> Value {
    let mut request = json!({
        "contents": contents,
        "system_instruction": { "parts": [{"text": system}] },
    });
    if tools[0]["functionDeclarations"]
        .as_array()
        .is_some_and(|d| !d.is_empty())
    {
        request["tools"] = tools.clone();
    }
    request
}

/// Maps one response part onto a turn event.
///
/// A part that is none of text / functionCall / functionResponse is a
/// protocol error, not silently dropped.
fn part_to_event(part: &Value, call_seq: &mut u64) -> Result<TurnEvent, ReasoningError> {
    if let Some(text) = part.get("text").and_then(Value::as_str) {
        return Ok(TurnEvent::TextFragment {
            content: text.to_string(),
        });
    }

    if let Some(call) = part.get("functionCall") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = match call.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                *call_seq += 1;
                call_seq.to_string()
            }
        };
        return Ok(TurnEvent::ToolCallRequest {
            id,
            name,
            arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
        });
    }

    if let Some(response) = part.get("functionResponse") {
        let payload = match response["response"].get("content") {
            Some(Value::String(text)) => Some(vec![ContentBlock::text(text.clone())]),
            Some(Value::Array(blocks)) => Some(
                serde_json::from_value(Value::Array(blocks.clone())).map_err(|e| {
                    ReasoningError::new(
                        ReasoningErrorKind::Protocol,
                        "malformed functionResponse content",
                    )
                    .with_details(e.to_string())
                })?,
            ),
            _ => None,
        };
        return Ok(TurnEvent::ToolCallResult {
            id: response
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: response
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            payload,
            is_error: response["response"]["is_error"].as_bool().unwrap_or(false),
        });
    }

    let keys = part
        .as_object()
        .map(|m| m.keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_else(|| part.to_string());
    Err(ReasoningError::new(
        ReasoningErrorKind::Protocol,
        format!("unrecognized response part ({keys})"),
    ))
}
