//! Message delivery.
//!
//! Every output channel implements [`MessageSink`]. The runner is generic over the sink so tests
//! can plug in an in-memory recorder; the binary uses [`OutputSink`], which picks the channel
//! from [`OutputConfig`].

pub mod framing;
pub mod mllp;
pub mod stream;

use crate::composer::OutboundMessage;
use crate::config::OutputConfig;
use crate::metrics::SimMetrics;
use crate::SendResult;
use std::future::Future;

pub use mllp::MllpSink;
pub use stream::{StreamLayout, StreamSink};

/// A destination for composed messages.
///
/// `send` resolves once the message is delivered (acknowledged, for MLLP) or definitely
/// failed. Calls may be concurrent; implementations keep their own ordering.
pub trait MessageSink: Send + Sync + 'static {
    fn send(&self, message: &OutboundMessage) -> impl Future<Output = SendResult<()>> + Send;

    /// Flushes and releases the channel. Called once, after every executor has exited.
    fn close(&self) -> impl Future<Output = SendResult<()>> + Send;
}

/// The sink selected by configuration.
pub enum OutputSink {
    Stdout(StreamSink<tokio::io::Stdout>),
    File(StreamSink<tokio::fs::File>),
    Mllp(MllpSink),
}

impl OutputSink {
    /// Opens the configured channel. MLLP connects lazily.
    pub async fn open(config: &OutputConfig, metrics: &SimMetrics) -> SendResult<Self> {
        Ok(match config {
            OutputConfig::Stdout => Self::Stdout(StreamSink::stdout()),
            OutputConfig::File { path } => Self::File(StreamSink::file(path).await?),
            OutputConfig::Mllp(mllp) => Self::Mllp(MllpSink::spawn(mllp.clone(), metrics.clone())),
        })
    }
}

impl MessageSink for OutputSink {
    async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
        match self {
            Self::Stdout(sink) => sink.send(message).await,
            Self::File(sink) => sink.send(message).await,
            Self::Mllp(sink) => sink.send(message).await,
        }
    }

    async fn close(&self) -> SendResult<()> {
        match self {
            Self::Stdout(sink) => sink.close().await,
            Self::File(sink) => sink.close().await,
            Self::Mllp(sink) => sink.close().await,
        }
    }
}

impl<W: tokio::io::AsyncWrite + Unpin + Send + 'static> MessageSink for StreamSink<W> {
    async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
        StreamSink::send(self, message).await
    }

    async fn close(&self) -> SendResult<()> {
        StreamSink::close(self).await
    }
}

impl MessageSink for MllpSink {
    async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
        MllpSink::send(self, message).await
    }

    async fn close(&self) -> SendResult<()> {
        MllpSink::close(self).await
    }
}
