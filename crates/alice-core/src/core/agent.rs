//! Turn orchestration: stream a reply, classify it live, run its blocks, loop.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::context::{FileMemoryStore, MemoryStore, build_system_prompt};
use super::conversation::Conversation;
use super::events::{AgentEvent, EventSender, Status};
use super::interrupt::InputChannel;
use crate::config::{Config, ContextConfig, InterruptPolicy};
use crate::providers::{ModelClient, ProviderError, ProviderStream, StreamEvent};
use crate::stream::{MarkerTable, StreamClassifier};
use crate::tools::{ExecutionResult, Sandbox, ToolInvocation, execution_order, format_feedback};

/// How often idle waits (request setup, quiet stream, running process) check
/// the input queue for an interrupt.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Session object built once at startup and shared by every turn.
pub struct AgentContext<C> {
    pub client: C,
    pub sandbox: Sandbox,
    pub markers: MarkerTable,
    pub store: Box<dyn MemoryStore>,
    pub context: ContextConfig,
    pub max_iterations: u32,
    pub interrupt_policy: InterruptPolicy,
}

impl<C: ModelClient> AgentContext<C> {
    /// Builds the session for project `root`.
    ///
    /// # Errors
    /// Returns an error if the sandbox or marker table cannot be built.
    pub fn new(client: C, config: &Config, root: &Path) -> Result<Self> {
        let sandbox = Sandbox::new(root, &config.sandbox).context("Failed to set up sandbox")?;
        let store = FileMemoryStore::new(sandbox.root());
        Ok(Self {
            client,
            markers: config.marker_table()?,
            store: Box::new(store),
            sandbox,
            context: config.context.clone(),
            max_iterations: config.agent.max_iterations.max(1),
            interrupt_policy: config.agent.interrupt_policy,
        })
    }

    pub fn system_prompt(&self) -> String {
        build_system_prompt(self.store.as_ref(), &self.context)
    }

    /// Starts a conversation holding only the current system message.
    pub fn new_conversation(&self) -> Conversation {
        Conversation::new(self.system_prompt())
    }

    fn refresh_system_prompt(&self, conversation: &mut Conversation) {
        if conversation.set_system_prompt(self.system_prompt()) {
            tracing::debug!("system prompt refreshed");
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a reply without executable blocks.
    Completed,
    /// An interrupt was observed before the turn could complete.
    Interrupted,
    /// The model call failed; the error was already reported.
    Failed,
    /// The iteration bound was reached while blocks kept coming.
    LimitReached,
}

enum StreamOutcome {
    Finished(String),
    Interrupted(String),
    Failed,
}

struct ToolRound {
    results: Vec<(ToolInvocation, ExecutionResult)>,
    skipped: Vec<ToolInvocation>,
    interrupted: bool,
}

/// Runs one user turn to completion or interruption.
///
/// Model and transport failures end the turn with an `error` event and
/// `Ok(TurnOutcome::Failed)`. An `Err` means an internal fault, such as the
/// presentation sink going away.
///
/// # Errors
/// Returns an error if events can no longer be delivered.
pub async fn run_turn<C: ModelClient>(
    ctx: &AgentContext<C>,
    conversation: &mut Conversation,
    input: &mut InputChannel,
    sender: &EventSender,
    user_text: &str,
) -> Result<TurnOutcome> {
    let span = tracing::info_span!("turn", id = %Uuid::new_v4());
    async move {
        conversation.push_user(user_text);

        for round in 1..=ctx.max_iterations {
            sender.status(Status::Thinking).await?;
            tracing::debug!(round, "requesting reply");

            let reply = match stream_reply(ctx, conversation, input, sender).await? {
                StreamOutcome::Finished(reply) => reply,
                StreamOutcome::Interrupted(partial) => {
                    tracing::info!(round, "turn interrupted while streaming");
                    if ctx.interrupt_policy == InterruptPolicy::Retain && !partial.is_empty() {
                        conversation.push_assistant(partial);
                    }
                    sender.status(Status::Done).await?;
                    return Ok(TurnOutcome::Interrupted);
                }
                StreamOutcome::Failed => {
                    sender.status(Status::Done).await?;
                    return Ok(TurnOutcome::Failed);
                }
            };

            let invocations = ctx.markers.extract_invocations(&reply);
            conversation.push_assistant(reply);
            if invocations.is_empty() {
                tracing::info!(round, "reply complete");
                sender.status(Status::Done).await?;
                return Ok(TurnOutcome::Completed);
            }

            sender.status(Status::ExecutingTool).await?;
            let tool_round = execute_blocks(ctx, input, invocations).await;
            conversation.push_feedback(format_feedback(&tool_round.results, &tool_round.skipped));
            ctx.refresh_system_prompt(conversation);

            if tool_round.interrupted {
                tracing::info!(round, "turn interrupted during execution");
                sender.status(Status::Done).await?;
                return Ok(TurnOutcome::Interrupted);
            }
        }

        tracing::warn!(max = ctx.max_iterations, "iteration limit reached");
        sender
            .send(AgentEvent::error(format!(
                "Stopped after {} model calls without a final answer",
                ctx.max_iterations
            )))
            .await?;
        sender.status(Status::Done).await?;
        Ok(TurnOutcome::LimitReached)
    }
    .instrument(span)
    .await
}

/// Opens the stream while watching for an interrupt.
async fn request_stream<C: ModelClient>(
    ctx: &AgentContext<C>,
    conversation: &Conversation,
    input: &mut InputChannel,
) -> Option<Result<ProviderStream>> {
    let request = ctx.client.stream_chat(conversation.messages());
    tokio::pin!(request);
    loop {
        tokio::select! {
            result = &mut request => return Some(result),
            () = sleep(INTERRUPT_POLL_INTERVAL) => {
                if input.poll_interrupt() {
                    return None;
                }
            }
        }
    }
}

/// Streams one reply through the classifier.
///
/// The input queue is drained before every event and on every quiet poll
/// tick. The classifier is flushed however the stream ends.
async fn stream_reply<C: ModelClient>(
    ctx: &AgentContext<C>,
    conversation: &Conversation,
    input: &mut InputChannel,
    sender: &EventSender,
) -> Result<StreamOutcome> {
    let mut stream = match request_stream(ctx, conversation, input).await {
        None => return Ok(StreamOutcome::Interrupted(String::new())),
        Some(Ok(stream)) => stream,
        Some(Err(err)) => {
            report_error(&err, sender).await?;
            return Ok(StreamOutcome::Failed);
        }
    };

    let mut classifier = StreamClassifier::new(ctx.markers.clone());
    let mut reply = String::new();
    let mut failure: Option<anyhow::Error> = None;
    let mut interrupted = false;

    loop {
        if input.poll_interrupt() {
            interrupted = true;
            break;
        }
        let event = match timeout(INTERRUPT_POLL_INTERVAL, stream.next()).await {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(err))) => {
                failure = Some(err.into());
                break;
            }
            Ok(None) => break,
            Err(_) => continue,
        };

        match event {
            StreamEvent::ReasoningDelta { text } => {
                sender.send(AgentEvent::Thinking { content: text }).await?;
            }
            StreamEvent::TextDelta { text } => {
                reply.push_str(&text);
                sender.segments(classifier.feed(&text)).await?;
            }
            StreamEvent::Usage(usage) => {
                sender
                    .send(AgentEvent::Tokens {
                        total: usage.total_tokens,
                        prompt: usage.prompt_tokens,
                        completion: usage.completion_tokens,
                    })
                    .await?;
            }
            StreamEvent::Error {
                error_type,
                message,
            } => {
                failure = Some(ProviderError::api_error(&error_type, &message).into());
                break;
            }
        }
    }
    // Dropping the stream closes the connection.
    drop(stream);
    sender.segments(classifier.flush()).await?;

    if let Some(err) = failure {
        report_error(&err, sender).await?;
        return Ok(StreamOutcome::Failed);
    }
    if interrupted {
        return Ok(StreamOutcome::Interrupted(reply));
    }
    Ok(StreamOutcome::Finished(reply))
}

/// Runs python blocks, then shell blocks, one at a time.
///
/// An interrupt seen before a block skips it and everything after it; one
/// seen while a block runs kills that block's process group.
async fn execute_blocks<C: ModelClient>(
    ctx: &AgentContext<C>,
    input: &mut InputChannel,
    invocations: Vec<ToolInvocation>,
) -> ToolRound {
    let mut pending = execution_order(invocations).into_iter();
    let mut round = ToolRound {
        results: Vec::new(),
        skipped: Vec::new(),
        interrupted: false,
    };

    while let Some(invocation) = pending.next() {
        if input.poll_interrupt() {
            round.interrupted = true;
            round.skipped.push(invocation);
            break;
        }

        tracing::info!(kind = %invocation.kind, "executing block");
        let cancel = CancellationToken::new();
        let result = {
            let run = ctx.sandbox.run(&invocation, &cancel);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    () = sleep(INTERRUPT_POLL_INTERVAL) => {
                        if input.poll_interrupt() {
                            round.interrupted = true;
                            cancel.cancel();
                        }
                    }
                }
            }
        };
        round.results.push((invocation, result));

        if round.interrupted {
            break;
        }
    }

    round.skipped.extend(pending);
    round
}

/// Reports a model/transport failure as one `error` event.
async fn report_error(err: &anyhow::Error, sender: &EventSender) -> Result<()> {
    let message = match err.downcast_ref::<ProviderError>() {
        Some(provider_err) => format!("{} ({})", provider_err.message, provider_err.kind),
        None => format!("{err:#}"),
    };
    tracing::error!("model call failed: {message}");
    sender.send(AgentEvent::error(message)).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use futures_util::stream;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::core::conversation::{Message, Role};
    use crate::core::events::{AgentEventRx, create_event_channel};
    use crate::core::interrupt::InputSender;
    use crate::providers::{ProviderErrorKind, Usage};

    /// Client that replays scripted replies and records every request.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Vec<StreamEvent>>>,
        /// Reply indices that should stall after their events.
        stall_after: Mutex<Vec<usize>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn stalling(self, index: usize) -> Self {
            self.stall_after.lock().unwrap().push(index);
            self
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ModelClient for ScriptedClient {
        async fn stream_chat(&self, messages: &[Message]) -> Result<ProviderStream> {
            let index = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(messages.to_vec());
                requests.len() - 1
            };
            let Some(events) = self.replies.lock().unwrap().pop_front() else {
                return Err(ProviderError::http_status(500, "no scripted reply").into());
            };
            let head = stream::iter(events.into_iter().map(Ok::<_, ProviderError>));
            if self.stall_after.lock().unwrap().contains(&index) {
                Ok(Box::pin(head.chain(stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }
    }

    fn text(t: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            text: t.to_string(),
        }
    }

    struct Harness {
        _temp: TempDir,
        ctx: AgentContext<ScriptedClient>,
        conversation: Conversation,
        input: InputChannel,
        input_tx: InputSender,
        sender: EventSender,
        rx: AgentEventRx,
    }

    fn harness(client: ScriptedClient, tweak: impl FnOnce(&mut Config)) -> Harness {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();
        let mut config = Config {
            sandbox: SandboxConfig {
                python: Some("python3".to_string()),
                ..SandboxConfig::default()
            },
            ..Config::default()
        };
        tweak(&mut config);
        let ctx = AgentContext::new(client, &config, temp.path()).unwrap();
        let conversation = ctx.new_conversation();
        let (input_tx, input) = InputChannel::new();
        let (tx, rx) = create_event_channel();
        Harness {
            _temp: temp,
            ctx,
            conversation,
            input,
            input_tx,
            sender: EventSender::new(tx),
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[AgentEvent]) -> Vec<Status> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Status { content } => Some(*content),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_reply_appends_one_assistant_message() {
        let client = ScriptedClient::new(vec![vec![
            StreamEvent::ReasoningDelta {
                text: "pondering".to_string(),
            },
            text("Hello "),
            text("there."),
            StreamEvent::Usage(Usage {
                total_tokens: 7,
                prompt_tokens: 5,
                completion_tokens: 2,
            }),
        ]]);
        let mut h = harness(client, |_| {});

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "hi")
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(h.ctx.client.requests().len(), 1);
        assert_eq!(h.conversation.len(), 3);
        assert_eq!(
            h.conversation.last(),
            Some(&Message::new(Role::Assistant, "Hello there."))
        );

        let events = drain(&mut h.rx);
        assert_eq!(
            events,
            vec![
                AgentEvent::status(Status::Thinking),
                AgentEvent::Thinking {
                    content: "pondering".to_string()
                },
                AgentEvent::Content {
                    content: "Hello ".to_string()
                },
                AgentEvent::Content {
                    content: "there.".to_string()
                },
                AgentEvent::Tokens {
                    total: 7,
                    prompt: 5,
                    completion: 2
                },
                AgentEvent::status(Status::Done),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_files_round_trip() {
        let client = ScriptedClient::new(vec![
            vec![text("Checking now."), text("\n```bash\nls\n```")],
            vec![text("There is one file: a.txt")],
        ]);
        let mut h = harness(client, |_| {});

        let outcome = run_turn(
            &h.ctx,
            &mut h.conversation,
            &mut h.input,
            &h.sender,
            "list files",
        )
        .await
        .unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);

        let events = drain(&mut h.rx);
        let visible: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(visible, "Checking now.\n");
        assert!(events.contains(&AgentEvent::Thinking {
            content: "```bash\nls\n```".to_string()
        }));
        assert_eq!(
            statuses(&events),
            vec![
                Status::Thinking,
                Status::ExecutingTool,
                Status::Thinking,
                Status::Done
            ]
        );

        // system, user, assistant(block), feedback, assistant(final)
        let messages = h.conversation.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].text, "Checking now.\n```bash\nls\n```");
        assert_eq!(messages[3].role, Role::ToolFeedback);
        assert!(messages[3].text.contains("Shell command `ls` result:\na.txt"));

        let requests = h.ctx.client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].len(), 4);
    }

    #[tokio::test]
    async fn test_python_runs_before_shell_in_one_feedback() {
        let reply = "```bash\necho from-shell\n```\n```python\nprint('from-python')\n```";
        let client = ScriptedClient::new(vec![vec![text(reply)], vec![text("done")]]);
        let mut h = harness(client, |_| {});

        run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "go")
            .await
            .unwrap();

        let feedback: Vec<&Message> = h
            .conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::ToolFeedback)
            .collect();
        assert_eq!(feedback.len(), 1);
        let text = &feedback[0].text;
        let python = text.find("from-python").unwrap();
        let shell = text.find("from-shell").unwrap();
        assert!(python < shell);
        assert_eq!(text.matches("from-python").count(), 1);
        assert_eq!(text.matches("from-shell").count(), 2); // heading + output
    }

    #[tokio::test]
    async fn test_interrupt_mid_stream_skips_tools() {
        let client = ScriptedClient::new(vec![
            vec![text("Partial answer ```bash\ntouch should-not-exist\n```")],
            vec![text("Fresh answer")],
        ])
        .stalling(0);
        let mut h = harness(client, |_| {});
        let root = h.ctx.sandbox.root().to_path_buf();

        let input_tx = h.input_tx.clone();
        let mut rx = h.rx;
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::Content { .. }) {
                    input_tx.interrupt();
                }
                let done = event == AgentEvent::status(Status::Done);
                seen.push(event);
                if done {
                    break;
                }
            }
            (seen, rx)
        });

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "go")
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Interrupted);

        let (events, mut rx) = watcher.await.unwrap();
        assert!(!statuses(&events).contains(&Status::ExecutingTool));
        assert_eq!(statuses(&events).last(), Some(&Status::Done));
        assert!(!root.join("should-not-exist").exists());
        // Partial reply discarded by default.
        assert_eq!(h.conversation.len(), 2);

        // The next turn is unaffected.
        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "again")
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(
            h.conversation.last(),
            Some(&Message::new(Role::Assistant, "Fresh answer"))
        );
        assert_eq!(statuses(&drain(&mut rx)).last(), Some(&Status::Done));
    }

    #[tokio::test]
    async fn test_retain_policy_keeps_partial_reply() {
        let client = ScriptedClient::new(vec![vec![text("half a thought")]]).stalling(0);
        let mut h = harness(client, |c| c.agent.interrupt_policy = InterruptPolicy::Retain);

        let input_tx = h.input_tx.clone();
        let mut rx = h.rx;
        let watcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::Content { .. }) {
                    input_tx.interrupt();
                }
                if event == AgentEvent::status(Status::Done) {
                    break;
                }
            }
        });

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "go")
            .await
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(outcome, TurnOutcome::Interrupted);
        assert_eq!(
            h.conversation.last(),
            Some(&Message::new(Role::Assistant, "half a thought"))
        );
    }

    #[tokio::test]
    async fn test_interrupt_during_execution_kills_block() {
        let client = ScriptedClient::new(vec![vec![text(
            "```bash\nsleep 30\n```\n```bash\ntouch skipped-marker\n```",
        )]]);
        let mut h = harness(client, |_| {});
        let root = h.ctx.sandbox.root().to_path_buf();

        let input_tx = h.input_tx.clone();
        let mut rx = h.rx;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event == AgentEvent::status(Status::ExecutingTool) {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    input_tx.interrupt();
                }
            }
        });

        let started = std::time::Instant::now();
        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "go")
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!root.join("skipped-marker").exists());
        let feedback = &h.conversation.last().unwrap().text;
        assert!(feedback.contains("[interrupted: execution cancelled by user]"));
        assert!(feedback.contains("[skipped: turn interrupted]"));
    }

    #[tokio::test]
    async fn test_transport_error_ends_turn_with_error_and_done() {
        let client = ScriptedClient::new(vec![]);
        let mut h = harness(client, |_| {});

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "hi")
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Failed);

        let events = drain(&mut h.rx);
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(statuses(&events).last(), Some(&Status::Done));
        // Only the user message was added.
        assert_eq!(h.conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_midstream_api_error_is_reported_once() {
        let client = ScriptedClient::new(vec![vec![
            text("partial"),
            StreamEvent::Error {
                error_type: "overloaded".to_string(),
                message: "busy".to_string(),
            },
        ]]);
        let mut h = harness(client, |_| {});

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "hi")
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Failed);

        let events = drain(&mut h.rx);
        let expected = format!("overloaded: busy ({})", ProviderErrorKind::ApiError);
        assert!(events.contains(&AgentEvent::error(expected)));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let block = || vec![text("```bash\necho again\n```")];
        let client = ScriptedClient::new(vec![block(), block(), block()]);
        let mut h = harness(client, |c| c.agent.max_iterations = 2);

        let outcome = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "loop")
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::LimitReached);
        assert_eq!(h.ctx.client.requests().len(), 2);

        let events = drain(&mut h.rx);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Error { .. })));
        assert_eq!(statuses(&events).last(), Some(&Status::Done));
    }

    #[tokio::test]
    async fn test_system_prompt_refreshed_after_tools() {
        let client = ScriptedClient::new(vec![
            vec![text(
                "```bash\nmkdir -p memory && echo 'remember me' > memory/alice_memory.md\n```",
            )],
            vec![text("saved")],
        ]);
        let mut h = harness(client, |_| {});

        run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "save")
            .await
            .unwrap();

        assert!(h.conversation.system_prompt().contains("remember me"));
        let requests = h.ctx.client.requests();
        assert!(requests[1][0].text.contains("remember me"));
    }

    #[tokio::test]
    async fn test_closed_sink_is_internal_fault() {
        let client = ScriptedClient::new(vec![vec![text("hi")]]);
        let mut h = harness(client, |_| {});
        drop(h.rx);

        let result = run_turn(&h.ctx, &mut h.conversation, &mut h.input, &h.sender, "hi").await;
        assert!(result.is_err());
    }
}
