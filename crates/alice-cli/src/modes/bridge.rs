//! JSON-lines bridge: input lines in on stdin, protocol records out on stdout.

use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alice_core::config::Config;
use alice_core::core::agent::{AgentContext, run_turn};
use alice_core::core::events::{
    AgentEvent, AgentEventRx, EventSender, Status, create_event_channel,
};
use alice_core::core::interrupt::{InputChannel, InputEvent, InputSender, spawn_listener};
use alice_core::providers::{OpenAIChatClient, OpenAIChatConfig};
use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::logging;

pub struct BridgeOptions<'a> {
    pub root: &'a Path,
    /// Config load result; a failure is reported as an initialization error.
    pub config: Result<Config>,
    pub model_override: Option<&'a str>,
}

/// Runs the bridge until input closes or an internal fault ends it.
///
/// # Errors
/// Returns an error if initialization fails or a turn hits an internal fault.
/// Both are reported on stdout as an `error` record first.
pub async fn run(opts: BridgeOptions<'_>) -> Result<()> {
    let _log_guard = match logging::init(opts.root) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {e:#}");
            None
        }
    };

    let (ctx, sentinel) = match init_context(opts) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("initialization failed: {e:#}");
            print_line(&AgentEvent::error(format!("Initialization failed: {e:#}")));
            return Err(e);
        }
    };
    tracing::info!(
        model = ctx.client.model(),
        root = %ctx.sandbox.root().display(),
        python = %ctx.sandbox.python().display(),
        "bridge started"
    );

    let (input_tx, mut input) = InputChannel::new();
    let ctrl_c_pending = install_ctrl_c(input_tx.clone())?;
    spawn_listener(BufReader::new(std::io::stdin()), sentinel, input_tx)
        .context("spawn input listener")?;

    let (tx, rx) = create_event_channel();
    let writer = spawn_writer(rx);
    let sender = EventSender::new(tx);

    let result = serve(&ctx, &mut input, &sender, &ctrl_c_pending).await;

    drop(sender);
    if let Err(e) = writer.await {
        tracing::warn!("writer task failed: {e}");
    }
    tracing::info!("bridge stopped");
    result
}

fn init_context(opts: BridgeOptions<'_>) -> Result<(AgentContext<OpenAIChatClient>, String)> {
    let config = opts.config?;
    let model = config.resolve_model(opts.model_override);
    let client = OpenAIChatClient::new(OpenAIChatConfig::from_config(&config, model)?);
    let ctx = AgentContext::new(client, &config, opts.root)?;
    Ok((ctx, config.agent.interrupt_sentinel))
}

/// The idle loop: one turn per non-blank line, until input closes.
async fn serve(
    ctx: &AgentContext<OpenAIChatClient>,
    input: &mut InputChannel,
    sender: &EventSender,
    ctrl_c_pending: &AtomicBool,
) -> Result<()> {
    let mut conversation = ctx.new_conversation();
    sender.status(Status::Ready).await?;

    loop {
        match input.next().await {
            InputEvent::Closed => return Ok(()),
            InputEvent::Interrupt => {
                tracing::debug!("interrupt while idle ignored");
                ctrl_c_pending.store(false, Ordering::SeqCst);
            }
            InputEvent::Line(line) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let outcome = run_turn(ctx, &mut conversation, input, sender, text).await;
                ctrl_c_pending.store(false, Ordering::SeqCst);
                match outcome {
                    Ok(outcome) => tracing::info!(?outcome, "turn finished"),
                    Err(e) => {
                        tracing::error!("internal fault: {e:#}");
                        // The sink may be the thing that failed; nothing more to do then.
                        let _ = sender
                            .send(AgentEvent::error(format!("Internal error: {e:#}")))
                            .await;
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Ctrl+C injects an interrupt; a second one before the turn resolves exits.
fn install_ctrl_c(input_tx: InputSender) -> Result<Arc<AtomicBool>> {
    let pending = Arc::new(AtomicBool::new(false));
    let handler_pending = Arc::clone(&pending);
    ctrlc::set_handler(move || {
        if handler_pending.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        input_tx.interrupt();
    })
    .context("install Ctrl+C handler")?;
    Ok(pending)
}

/// Drains the event channel to stdout, one flushed line per record.
fn spawn_writer(mut rx: AgentEventRx) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !print_line(&event) {
                break;
            }
        }
    })
}

fn print_line(event: &AgentEvent) -> bool {
    let line = event.to_json_line();
    tracing::debug!(%line, "record");
    let mut stdout = std::io::stdout().lock();
    match writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("stdout closed: {e}");
            false
        }
    }
}
