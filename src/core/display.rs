//! Serialized progress display.
//!
//! Subprocesses of independent activations run concurrently, but their
//! output is shown one task at a time. A [`DisplayQueue`] hands out turns
//! in the order they are requested; each turn waits for the previous one to
//! be dropped before its owner may write to the [`Console`].

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::adapters::{OutputChunk, OutputStream};

/// Chain of display turns
#[derive(Debug, Default)]
pub struct DisplayQueue {
    tail: Option<oneshot::Receiver<()>>,
}

impl DisplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next turn
    pub fn enqueue(&mut self) -> DisplayTurn {
        let (release, next) = oneshot::channel();
        DisplayTurn {
            previous: self.tail.replace(next),
            _release: release,
        }
    }
}

/// A reserved slot in the display order; dropping it passes the turn on
#[derive(Debug)]
pub struct DisplayTurn {
    previous: Option<oneshot::Receiver<()>>,
    _release: oneshot::Sender<()>,
}

impl DisplayTurn {
    /// Wait until every earlier turn is finished
    pub async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The sender is only ever dropped, never used
            let _ = previous.await;
        }
    }
}

/// Destination of user-facing progress output
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Console")
    }
}

impl Console {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Console writing into memory, and a handle to read it back
    pub fn capture() -> (Self, CapturedOutput) {
        let buffer = CapturedOutput::default();
        (Self::new(buffer.clone()), buffer)
    }

    pub fn write(&self, text: &str) {
        if let Ok(mut out) = self.out.lock() {
            // Progress output is best effort
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }

    pub fn line(&self, text: &str) {
        self.write(&format!("{}\n", text));
    }

    /// Show a titled task window with the selected streams of its output
    ///
    /// Returns once the output channel closes.
    pub async fn show_task(
        &self,
        title: &str,
        output: &mut UnboundedReceiver<OutputChunk>,
        streams: &[OutputStream],
    ) {
        self.line(&format!("==> {}", title));

        let mut ends_with_newline = true;
        while let Some(chunk) = output.recv().await {
            if !streams.contains(&chunk.stream) || chunk.text.is_empty() {
                continue;
            }
            ends_with_newline = chunk.text.ends_with('\n');
            self.write(&chunk.text);
        }

        if !ends_with_newline {
            self.write("\n");
        }
    }
}

/// In-memory console contents
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut inner) = self.0.lock() {
            inner.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_turns_follow_enqueue_order() {
        let mut queue = DisplayQueue::new();
        let (console, captured) = Console::capture();

        let mut first = queue.enqueue();
        let mut second = queue.enqueue();

        let late = {
            let console = console.clone();
            tokio::spawn(async move {
                second.wait().await;
                console.line("second");
            })
        };

        // Give the second task every chance to jump the queue
        tokio::task::yield_now().await;
        first.wait().await;
        console.line("first");
        drop(first);

        late.await.unwrap();
        assert_eq!(captured.contents(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_show_task_filters_streams() {
        let (console, captured) = Console::capture();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.send(OutputChunk {
            stream: OutputStream::Stdout,
            text: "result\n".to_string(),
        })
        .unwrap();
        tx.send(OutputChunk {
            stream: OutputStream::Stderr,
            text: "progress".to_string(),
        })
        .unwrap();
        drop(tx);

        console
            .show_task("Building x...", &mut rx, &[OutputStream::Stderr])
            .await;
        assert_eq!(captured.contents(), "==> Building x...\nprogress\n");
    }
}
