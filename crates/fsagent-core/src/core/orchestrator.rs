//! Drives one conversation: spawns the tool channel, runs turns against
//! the reasoning engine, dispatches tool calls, and renders transcripts.

use anyhow::{Result, bail};
use serde_json::Value;

use crate::core::events::{ContentBlock, TurnEvent};
use crate::core::session::{CURRENT_DIRECTORY_KEY, ConversationSession};
use crate::core::transcript::format_events;
use crate::mcp::{
    ChannelError, ChannelErrorKind, ChannelOptions, ServerCommand, ToolCatalog, ToolChannel,
    ToolPayload,
};
use crate::reasoning::{ReasoningClient, TurnStream};

/// Executes a single tool invocation on behalf of a turn.
///
/// Seam between the turn loop and the channel so the loop can be tested
/// without a subprocess.
pub trait ToolInvoker: Send {
    fn invoke(
        &mut self,
        name: &str,
        arguments: &Value,
    ) -> impl Future<Output = Result<ToolPayload, ChannelError>> + Send;
}

impl ToolInvoker for ToolChannel {
    async fn invoke(&mut self, name: &str, arguments: &Value) -> Result<ToolPayload, ChannelError> {
        ToolChannel::invoke(self, name, arguments).await
    }
}

/// Why a turn stopped before its stream was exhausted.
#[derive(Debug, Clone)]
pub struct TurnFailure {
    pub message: String,
    /// True when the tool channel is gone and no further turn can run.
    pub fatal: bool,
}

/// Everything one turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub events: Vec<TurnEvent>,
    pub failure: Option<TurnFailure>,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    /// Renders the turn for display. A failed turn keeps the events it
    /// got and appends one error line.
    pub fn transcript(&self) -> String {
        match &self.failure {
            None => format_events(&self.events),
            Some(failure) => {
                let error_line = format!("[Error] turn failed: {}", failure.message);
                if self.events.is_empty() {
                    error_line
                } else {
                    format!("{}\n{error_line}", format_events(&self.events))
                }
            }
        }
    }
}

/// Runs one turn to completion: pulls events, dispatches tool calls,
/// feeds results back, and accumulates everything in arrival order.
///
/// Recoverable tool failures (timeout, server-reported error, unknown
/// tool) become error results the engine can react to; only subprocess
/// death or a broken stream ends the turn early.
pub async fn drive_turn<S, I>(stream: &mut S, invoker: &mut I, catalog: &ToolCatalog) -> TurnOutcome
where
    S: TurnStream,
    I: ToolInvoker,
{
    let mut events: Vec<TurnEvent> = Vec::new();

    loop {
        let event = match stream.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => return TurnOutcome { events, failure: None },
            Err(e) => {
                tracing::warn!(error = %e, "reasoning stream failed");
                return TurnOutcome {
                    events,
                    failure: Some(TurnFailure {
                        message: e.to_string(),
                        fatal: false,
                    }),
                };
            }
        };

        match event {
            TurnEvent::TextFragment { .. } | TurnEvent::ToolCallResult { .. } => {
                events.push(event);
            }
            TurnEvent::ToolCallRequest {
                ref id,
                ref name,
                ref arguments,
            } => {
                tracing::info!(id = %id, tool = %name, "dispatching tool call");
                let (id, name, arguments) = (id.clone(), name.clone(), arguments.clone());
                events.push(event);

                let result = if catalog.contains(&name) {
                    invoker.invoke(&name, &arguments).await
                } else {
                    Err(ChannelError::new(
                        ChannelErrorKind::Protocol,
                        format!("tool '{name}' is not in the discovered catalog"),
                    ))
                };

                let result_event = match result {
                    Ok(payload) => TurnEvent::ToolCallResult {
                        id,
                        name,
                        payload: payload.content,
                        is_error: payload.is_error,
                    },
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "tool channel lost mid-turn");
                        return TurnOutcome {
                            events,
                            failure: Some(TurnFailure {
                                message: e.to_string(),
                                fatal: true,
                            }),
                        };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, tool = %name, "tool call failed");
                        TurnEvent::ToolCallResult {
                            id,
                            name,
                            payload: Some(vec![ContentBlock::text(e.to_string())]),
                            is_error: true,
                        }
                    }
                };

                if let Err(e) = stream.push_result(&result_event) {
                    events.push(result_event);
                    return TurnOutcome {
                        events,
                        failure: Some(TurnFailure {
                            message: e.to_string(),
                            fatal: false,
                        }),
                    };
                }
                events.push(result_event);
            }
        }
    }
}

/// One conversation: a reasoning client, a tool channel, and the session
/// state threaded between turns.
pub struct AgentOrchestrator<R: ReasoningClient> {
    client: R,
    command: ServerCommand,
    options: ChannelOptions,
    root: String,
    channel: Option<ToolChannel>,
    catalog: ToolCatalog,
    session: ConversationSession,
    poisoned: bool,
}

impl<R: ReasoningClient> AgentOrchestrator<R> {
    pub fn new(client: R, command: ServerCommand, options: ChannelOptions, root: &str) -> Self {
        Self {
            client,
            command,
            options,
            root: root.to_string(),
            channel: None,
            catalog: ToolCatalog::default(),
            session: ConversationSession::new("user_fs", root),
            poisoned: false,
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Launches the tool server and discovers its catalog.
    ///
    /// # Errors
    /// Fails when the subprocess cannot be spawned, the handshake times
    /// out, or discovery returns malformed descriptors.
    pub async fn start(&mut self) -> Result<()> {
        if self.channel.is_some() {
            bail!("orchestrator is already started");
        }
        let mut channel = ToolChannel::launch(&self.command, self.options).await?;
        self.catalog = channel.list_tools().await?;
        self.channel = Some(channel);
        self.poisoned = false;
        tracing::info!(
            session = %self.session.session_id,
            tools = self.catalog.len(),
            "orchestrator ready"
        );
        Ok(())
    }

    /// Runs one full turn and returns its transcript.
    ///
    /// A turn that fails recoverably still returns a transcript (with a
    /// trailing error line). After a fatal failure every subsequent call
    /// fails fast until `shutdown` and a fresh `start`.
    ///
    /// # Errors
    /// Fails when called before `start` or after the channel was lost.
    pub async fn ask(&mut self, user_message: &str) -> Result<String> {
        if self.poisoned {
            bail!("tool channel lost; shut down and start again");
        }
        let Some(channel) = self.channel.as_mut() else {
            bail!("orchestrator is not started");
        };

        let turn = self.session.begin_turn();
        tracing::info!(turn, "starting turn");

        let mut stream = self
            .client
            .begin_turn(&self.session, user_message, &self.catalog)
            .await?;
        let outcome = drive_turn(&mut stream, channel, &self.catalog).await;

        apply_state_changes(&mut self.session, &outcome.events);
        if let Some(failure) = &outcome.failure {
            if failure.fatal {
                self.poisoned = true;
            }
            tracing::warn!(turn, fatal = failure.fatal, "turn failed: {}", failure.message);
        } else {
            tracing::info!(turn, events = outcome.events.len(), "turn complete");
        }

        Ok(outcome.transcript())
    }

    /// Tears down the tool channel and ends the conversation. Idempotent;
    /// safe before `start`.
    ///
    /// The session and the reasoning context die with the conversation: a
    /// later `start` begins a fresh one.
    pub async fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.catalog = ToolCatalog::default();
        self.session = ConversationSession::new("user_fs", &self.root);
        self.client.reset();
        self.poisoned = false;
    }
}

/// Tools whose `path` argument names a directory the conversation is now
/// working in.
const DIRECTORY_TOOLS: &[&str] = &[
    "list_directory",
    "list_directory_with_sizes",
    "directory_tree",
    "create_directory",
];

/// Folds successful tool calls back into session state: a directory tool
/// that succeeded with a `path` argument moves the working directory
/// there. File-level tools carry file paths and are ignored.
fn apply_state_changes(session: &mut ConversationSession, events: &[TurnEvent]) {
    for event in events {
        let TurnEvent::ToolCallResult { id, name, is_error: false, .. } = event else {
            continue;
        };
        if !DIRECTORY_TOOLS.contains(&name.as_str()) {
            continue;
        }
        let path = events.iter().find_map(|e| match e {
            TurnEvent::ToolCallRequest {
                id: request_id,
                arguments,
                ..
            } if request_id == id => arguments.get("path").and_then(Value::as_str),
            _ => None,
        });
        if let Some(path) = path {
            session.set_state(CURRENT_DIRECTORY_KEY, Value::from(path));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;
    use crate::mcp::ToolDescriptor;
    use crate::reasoning::{ReasoningError, ReasoningErrorKind, ScriptedClient, ScriptedTurn};

    struct FakeInvoker {
        replies: VecDeque<Result<ToolPayload, ChannelError>>,
        calls: Vec<(String, Value)>,
    }

    impl FakeInvoker {
        fn new(replies: Vec<Result<ToolPayload, ChannelError>>) -> Self {
            Self {
                replies: replies.into(),
                calls: Vec::new(),
            }
        }
    }

    impl ToolInvoker for FakeInvoker {
        async fn invoke(
            &mut self,
            name: &str,
            arguments: &Value,
        ) -> Result<ToolPayload, ChannelError> {
            self.calls.push((name.to_string(), arguments.clone()));
            self.replies.pop_front().unwrap_or_else(|| {
                Err(ChannelError::new(ChannelErrorKind::Protocol, "unscripted call"))
            })
        }
    }

    fn catalog() -> ToolCatalog {
        ToolCatalog::from_descriptors(vec![ToolDescriptor {
            name: "list_directory".to_string(),
            description: String::new(),
            input_schema: json!({}),
        }])
    }

    fn call_request(id: &str) -> TurnEvent {
        TurnEvent::ToolCallRequest {
            id: id.to_string(),
            name: "list_directory".to_string(),
            arguments: json!({"path": "/tmp"}),
        }
    }

    /// A text-only turn completes without touching the invoker.
    #[tokio::test]
    async fn test_text_only_turn() {
        let mut stream = ScriptedTurn::new(vec![TurnEvent::TextFragment {
            content: "Hello.".to_string(),
        }]);
        let mut invoker = FakeInvoker::new(vec![]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.transcript(), "Hello.");
        assert!(invoker.calls.is_empty());
    }

    /// A tool call is dispatched, its result recorded after the request
    /// and pushed back into the stream.
    #[tokio::test]
    async fn test_tool_call_turn() {
        let mut stream = ScriptedTurn::new(vec![call_request("1")]);
        let mut invoker = FakeInvoker::new(vec![Ok(ToolPayload {
            content: Some(vec![ContentBlock::text("a.txt")]),
            is_error: false,
        })]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        assert!(outcome.is_complete());
        assert_eq!(invoker.calls, vec![("list_directory".to_string(), json!({"path": "/tmp"}))]);
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(stream.pushed_results().len(), 1);
        assert_eq!(
            outcome.transcript(),
            "[Function Call] name: list_directory, args: {'path': '/tmp'}\n\
             [Function Response] id: 1, name: list_directory\n  - a.txt"
        );
    }

    /// A recoverable channel error becomes an error result and the turn
    /// keeps going.
    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let mut stream = ScriptedTurn::new(vec![
            call_request("1"),
            TurnEvent::TextFragment {
                content: "That took too long.".to_string(),
            },
        ]);
        let mut invoker = FakeInvoker::new(vec![Err(ChannelError::new(
            ChannelErrorKind::Timeout,
            "no reply within 60 seconds",
        ))]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        assert!(outcome.is_complete());
        let TurnEvent::ToolCallResult { is_error, payload, .. } = &outcome.events[1] else {
            panic!("expected a tool result");
        };
        assert!(*is_error);
        assert_eq!(
            payload.as_ref().unwrap()[0].text.as_deref(),
            Some("timeout: no reply within 60 seconds")
        );
        assert!(matches!(&outcome.events[2], TurnEvent::TextFragment { .. }));
    }

    /// Subprocess death ends the turn with a fatal failure and an error
    /// line in the transcript.
    #[tokio::test]
    async fn test_channel_death_is_fatal() {
        let mut stream = ScriptedTurn::new(vec![call_request("1")]);
        let mut invoker = FakeInvoker::new(vec![Err(ChannelError::new(
            ChannelErrorKind::SubprocessExited,
            "tool server closed its stdout",
        ))]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        let failure = outcome.failure.as_ref().unwrap();
        assert!(failure.fatal);
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.transcript().ends_with(
            "[Error] turn failed: subprocess_exited: tool server closed its stdout"
        ));
    }

    /// A call to a tool outside the catalog is refused locally.
    #[tokio::test]
    async fn test_unknown_tool_is_refused() {
        let mut stream = ScriptedTurn::new(vec![TurnEvent::ToolCallRequest {
            id: "1".to_string(),
            name: "delete_everything".to_string(),
            arguments: json!({}),
        }]);
        let mut invoker = FakeInvoker::new(vec![]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        assert!(outcome.is_complete());
        assert!(invoker.calls.is_empty());
        let TurnEvent::ToolCallResult { is_error, .. } = &outcome.events[1] else {
            panic!("expected a tool result");
        };
        assert!(*is_error);
    }

    /// A broken reasoning stream fails the turn non-fatally.
    #[tokio::test]
    async fn test_stream_error_fails_turn() {
        let mut stream = ScriptedTurn::ending_in_error(
            vec![TurnEvent::TextFragment {
                content: "partial".to_string(),
            }],
            ReasoningError::new(ReasoningErrorKind::Api, "Gemini returned HTTP 500"),
        );
        let mut invoker = FakeInvoker::new(vec![]);

        let outcome = drive_turn(&mut stream, &mut invoker, &catalog()).await;

        let failure = outcome.failure.as_ref().unwrap();
        assert!(!failure.fatal);
        assert_eq!(
            outcome.transcript(),
            "partial\n[Error] turn failed: api: Gemini returned HTTP 500"
        );
    }

    /// A successful call with a path argument moves the session's working
    /// directory; a failed one does not.
    #[test]
    fn test_state_changes_follow_successful_calls() {
        let mut session = ConversationSession::new("user_fs", "/srv/files");

        apply_state_changes(
            &mut session,
            &[
                call_request("1"),
                TurnEvent::ToolCallResult {
                    id: "1".to_string(),
                    name: "list_directory".to_string(),
                    payload: None,
                    is_error: false,
                },
            ],
        );
        assert_eq!(session.state(CURRENT_DIRECTORY_KEY).unwrap(), &json!("/tmp"));

        apply_state_changes(
            &mut session,
            &[
                TurnEvent::ToolCallRequest {
                    id: "2".to_string(),
                    name: "list_directory".to_string(),
                    arguments: json!({"path": "/nope"}),
                },
                TurnEvent::ToolCallResult {
                    id: "2".to_string(),
                    name: "list_directory".to_string(),
                    payload: None,
                    is_error: true,
                },
            ],
        );
        assert_eq!(session.state(CURRENT_DIRECTORY_KEY).unwrap(), &json!("/tmp"));
    }

    /// File-level tools carry file paths; they never become the working
    /// directory.
    #[test]
    fn test_file_tools_do_not_move_directory() {
        let mut session = ConversationSession::new("user_fs", "/srv/files");

        apply_state_changes(
            &mut session,
            &[
                TurnEvent::ToolCallRequest {
                    id: "1".to_string(),
                    name: "read_file".to_string(),
                    arguments: json!({"path": "/srv/files/notes.txt"}),
                },
                TurnEvent::ToolCallResult {
                    id: "1".to_string(),
                    name: "read_file".to_string(),
                    payload: Some(vec![ContentBlock::text("hello")]),
                    is_error: false,
                },
            ],
        );
        assert_eq!(
            session.state(CURRENT_DIRECTORY_KEY).unwrap(),
            &json!("/srv/files")
        );
    }

    /// `ask` before `start` fails fast, and `shutdown` before `start` is
    /// a no-op.
    #[tokio::test]
    async fn test_ask_requires_start() {
        let client = ScriptedClient::new(vec![]);
        let command = ServerCommand {
            program: "true".to_string(),
            args: vec![],
        };
        let mut orchestrator =
            AgentOrchestrator::new(client, command, ChannelOptions::default(), "/srv/files");

        let err = orchestrator.ask("hello").await.unwrap_err();
        assert!(err.to_string().contains("not started"));
        orchestrator.shutdown().await;
    }
}
