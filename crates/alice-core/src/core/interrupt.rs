//! Input queue shared by the stdin listener, the Ctrl+C handler and the turn loop.
//!
//! The listener thread is the only component that blocks, and it blocks only
//! on reading input. The turn loop drains the queue without waiting at its
//! checkpoints; anything other than an interrupt is kept, in order, for the
//! idle loop to pick up once the turn resolves.

use std::collections::VecDeque;
use std::io::BufRead;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

/// One item from the external input source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// An ordinary input line, without its terminator.
    Line(String),
    /// The interrupt sentinel (or Ctrl+C).
    Interrupt,
    /// End of input. Nothing follows.
    Closed,
}

/// Producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<InputEvent>,
}

impl InputSender {
    /// Queues an event. Returns false once the consumer is gone.
    pub fn send(&self, event: InputEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn interrupt(&self) -> bool {
        self.send(InputEvent::Interrupt)
    }
}

/// Consumer side, owned by the turn-processing task.
#[derive(Debug)]
pub struct InputChannel {
    rx: mpsc::UnboundedReceiver<InputEvent>,
    backlog: VecDeque<InputEvent>,
}

impl InputChannel {
    pub fn new() -> (InputSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InputSender { tx },
            Self {
                rx,
                backlog: VecDeque::new(),
            },
        )
    }

    /// Drains everything queued without waiting.
    ///
    /// Returns true if an interrupt was among the drained events. Other
    /// events are kept for [`next`](Self::next) in arrival order.
    pub fn poll_interrupt(&mut self) -> bool {
        let mut interrupted = false;
        while let Ok(event) = self.rx.try_recv() {
            match event {
                InputEvent::Interrupt => interrupted = true,
                other => self.backlog.push_back(other),
            }
        }
        interrupted
    }

    /// Next event for the idle loop between turns.
    ///
    /// Yields `Closed` once every producer is gone.
    pub async fn next(&mut self) -> InputEvent {
        if let Some(event) = self.backlog.pop_front() {
            return event;
        }
        self.rx.recv().await.unwrap_or(InputEvent::Closed)
    }
}

/// Starts the blocking listener thread over `reader`.
///
/// Lines whose trimmed text equals `sentinel` become [`InputEvent::Interrupt`].
/// End of input or a read error queues one [`InputEvent::Closed`] and ends the
/// thread.
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn_listener<R>(
    reader: R,
    sentinel: impl Into<String>,
    sender: InputSender,
) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    let sentinel = sentinel.into();
    thread::Builder::new()
        .name("alice-input".to_string())
        .spawn(move || listen(reader, &sentinel, &sender))
}

fn listen<R: BufRead>(mut reader: R, sentinel: &str, sender: &InputSender) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                let event = if line.trim() == sentinel {
                    InputEvent::Interrupt
                } else {
                    InputEvent::Line(line.to_string())
                };
                if !sender.send(event) {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("input listener stopped: {e}");
                break;
            }
        }
    }
    tracing::debug!("input closed");
    sender.send(InputEvent::Closed);
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_listener_classifies_lines() {
        let (sender, mut channel) = InputChannel::new();
        let input = Cursor::new("hello\r\n __INTERRUPT__ \n\nbye");
        spawn_listener(input, "__INTERRUPT__", sender)
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(channel.next().await, InputEvent::Line("hello".to_string()));
        assert_eq!(channel.next().await, InputEvent::Interrupt);
        assert_eq!(channel.next().await, InputEvent::Line(String::new()));
        assert_eq!(channel.next().await, InputEvent::Line("bye".to_string()));
        assert_eq!(channel.next().await, InputEvent::Closed);
        // All producers are gone.
        assert_eq!(channel.next().await, InputEvent::Closed);
    }

    #[tokio::test]
    async fn test_poll_interrupt_keeps_other_events_in_order() {
        let (sender, mut channel) = InputChannel::new();
        sender.send(InputEvent::Line("one".to_string()));
        sender.interrupt();
        sender.send(InputEvent::Line("two".to_string()));
        sender.send(InputEvent::Closed);

        assert!(channel.poll_interrupt());
        assert!(!channel.poll_interrupt());

        assert_eq!(channel.next().await, InputEvent::Line("one".to_string()));
        assert_eq!(channel.next().await, InputEvent::Line("two".to_string()));
        assert_eq!(channel.next().await, InputEvent::Closed);
    }

    #[test]
    fn test_poll_interrupt_on_empty_queue() {
        let (_sender, mut channel) = InputChannel::new();
        assert!(!channel.poll_interrupt());
    }

    #[test]
    fn test_listener_stops_when_consumer_dropped() {
        let (sender, channel) = InputChannel::new();
        drop(channel);
        let handle = spawn_listener(Cursor::new("a\nb\n"), "__INTERRUPT__", sender).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_custom_sentinel() {
        let (sender, mut channel) = InputChannel::new();
        spawn_listener(Cursor::new("STOP\n__INTERRUPT__\n"), "STOP", sender)
            .unwrap()
            .join()
            .unwrap();

        assert!(channel.poll_interrupt());
        assert_eq!(
            channel.backlog.pop_front(),
            Some(InputEvent::Line("__INTERRUPT__".to_string()))
        );
    }
}
