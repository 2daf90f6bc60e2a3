//! Append-only sinks: the console and a plain file.

use crate::composer::OutboundMessage;
use crate::{SendError, SendResult};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamLayout {
    /// One segment per line, for reading on a terminal.
    Console,
    /// Segments keep their `\r` terminators.
    File,
}

/// Writes every message, followed by a blank line, to `W`.
#[derive(Debug)]
pub struct StreamSink<W> {
    writer: Mutex<W>,
    layout: StreamLayout,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(writer: W, layout: StreamLayout) -> Self {
        Self {
            writer: Mutex::new(writer),
            layout,
        }
    }

    fn render(&self, message: &OutboundMessage) -> String {
        match self.layout {
            StreamLayout::Console => {
                let mut out = message
                    .payload
                    .split('\r')
                    .filter(|segment| !segment.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                out.push_str("\n\n");
                out
            }
            StreamLayout::File => format!("{}\n\n", message.payload),
        }
    }

    /// Any I/O failure here is fatal for the run.
    pub async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
        let text = self.render(message);
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> SendResult<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.shutdown().await.map_err(SendError::Io)
    }

    #[cfg(test)]
    pub(crate) async fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl StreamSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout(), StreamLayout::Console)
    }
}

impl StreamSink<tokio::fs::File> {
    /// Opens `path` for appending, creating it if needed.
    pub async fn file(path: &Path) -> SendResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file, StreamLayout::File))
    }
}
