//! Persistent MLLP connection behind a single-consumer mailbox.
//!
//! [`MllpSink`] is a cheap front end: every `send` puts the message and a reply channel in the
//! mailbox and waits. One connection task owns the socket and works through the mailbox in
//! order, so at most one content frame is ever waiting for its ACK and a message that has to be
//! resent always goes out again before anything queued behind it.
//!
//! A request whose caller has gone away (the executor was cancelled) is never written, and a
//! delivery in progress is abandoned as soon as the caller drops its `send` future. `close`
//! discards whatever is still queued.
//!
//! Connection states, as seen by the task:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> AwaitingAck -> Connected
//!                     |                           |
//!                     +-------> Disconnected <----+  (connect failure, timeout, I/O error)
//! ```

use super::framing::{write_frame, FrameReader};
use crate::composer::OutboundMessage;
use crate::config::MllpConfig;
use crate::metrics::SimMetrics;
use crate::{SendError, SendResult};
use hl7::Ack;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const MAILBOX_CAPACITY: usize = 256;

struct Request {
    message: OutboundMessage,
    reply: oneshot::Sender<SendResult<()>>,
}

/// Counters shared between the sink and its connection task.
#[derive(Debug, Default)]
struct LinkStats {
    reconnects: AtomicU64,
    keep_alives: AtomicU64,
    unavailable: AtomicBool,
}

pub struct MllpSink {
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    stats: Arc<LinkStats>,
}

impl MllpSink {
    /// Starts the connection task. The first connection is made lazily, on the first message
    /// or keep-alive tick.
    pub fn spawn(config: MllpConfig, metrics: SimMetrics) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let stats = Arc::new(LinkStats::default());
        let span = info_span!("mllp", destination = %config.destination);
        let connection = Connection {
            config,
            link: None,
            has_connected: false,
            connect_failures: 0,
            last_activity: Instant::now(),
            stats: stats.clone(),
            metrics,
        };
        let stop = CancellationToken::new();
        let task = tokio::spawn(connection.run(rx, stop.clone()).instrument(span));
        Self {
            requests: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            stop,
            stats,
        }
    }

    /// True once the destination has been declared unavailable.
    pub fn failed(&self) -> bool {
        self.stats.unavailable.load(Ordering::Relaxed)
    }

    /// Connections re-established after the first one.
    pub fn reconnects(&self) -> u64 {
        self.stats.reconnects.load(Ordering::Relaxed)
    }

    pub fn keep_alives(&self) -> u64 {
        self.stats.keep_alives.load(Ordering::Relaxed)
    }

    /// Queues `message` and waits until it is acknowledged or given up on.
    pub async fn send(&self, message: &OutboundMessage) -> SendResult<()> {
        let requests = self.requests.lock().clone().ok_or(SendError::Closed)?;
        let (reply, response) = oneshot::channel();
        requests
            .send(Request {
                message: message.clone(),
                reply,
            })
            .await
            .map_err(|_| SendError::Closed)?;
        response.await.map_err(|_| SendError::Closed)?
    }

    /// Closes the mailbox and stops the connection task.
    ///
    /// Requests still queued are answered with [`SendError::Closed`] and never written. A
    /// delivery in progress is abandoned, so this returns within one connection round trip.
    pub async fn close(&self) -> SendResult<()> {
        drop(self.requests.lock().take());
        self.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "MLLP connection task failed");
            }
        }
        Ok(())
    }
}

struct Link {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct Connection {
    config: MllpConfig,
    link: Option<Link>,
    has_connected: bool,
    connect_failures: u32,
    last_activity: Instant,
    stats: Arc<LinkStats>,
    metrics: SimMetrics,
}

impl Connection {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>, stop: CancellationToken) {
        loop {
            let keep_alive_due = self
                .config
                .keep_alive
                .map(|interval| self.last_activity + interval);
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    self.handle(request, &stop).await;
                }
                _ = sleep_until(keep_alive_due.unwrap_or_else(Instant::now)), if keep_alive_due.is_some() => {
                    self.keep_alive().await;
                }
            }
        }

        requests.close();
        let mut discarded = 0usize;
        while let Ok(Request { reply, .. }) = requests.try_recv() {
            let _ = reply.send(Err(SendError::Closed));
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "sender closed with messages still queued");
        }
        self.link = None;
        debug!("MLLP connection task stopped");
    }

    /// Delivers one request unless its caller has already given up on it.
    async fn handle(&mut self, request: Request, stop: &CancellationToken) {
        let Request { message, mut reply } = request;
        if reply.is_closed() {
            debug!(control_id = %message.control_id, "caller cancelled, message not sent");
            return;
        }

        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => Some(Err(SendError::Closed)),
            _ = reply.closed() => None,
            result = self.deliver(&message) => Some(result),
        };
        match result {
            Some(Ok(())) => {
                let _ = reply.send(Ok(()));
            }
            Some(Err(err)) => {
                if stop.is_cancelled() {
                    // The abandoned attempt may have left half a frame or an unread ACK.
                    self.link = None;
                }
                let _ = reply.send(Err(err));
            }
            None => {
                self.link = None;
                debug!(control_id = %message.control_id, "caller cancelled, delivery abandoned");
            }
        }
    }

    /// Sends `message` until it is acknowledged or its attempt budget runs out.
    async fn deliver(&mut self, message: &OutboundMessage) -> SendResult<()> {
        let retry = self.config.retry.clone();
        let mut last = String::new();
        for attempt in 1..=retry.max_attempts {
            if self.stats.unavailable.load(Ordering::Relaxed) {
                return Err(self.unavailable());
            }
            let wait = retry.backoff(attempt);
            if !wait.is_zero() {
                sleep(wait).await;
            }
            match self.attempt(message).await {
                Ok(()) => {
                    debug!(control_id = %message.control_id, attempt, "message acknowledged");
                    return Ok(());
                }
                Err(err @ SendError::Unavailable { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        control_id = %message.control_id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        error = %err,
                        "MLLP delivery attempt failed"
                    );
                    last = err.to_string();
                }
            }
        }
        Err(SendError::RetriesExhausted {
            control_id: message.control_id.to_string(),
            attempts: retry.max_attempts,
            last,
        })
    }

    async fn attempt(&mut self, message: &OutboundMessage) -> SendResult<()> {
        self.ensure_connected().await?;
        let control_id = message.control_id.as_str();
        let ack_timeout = self.config.retry.ack_timeout;
        let Some(link) = self.link.as_mut() else {
            return Err(SendError::Io(io::ErrorKind::NotConnected.into()));
        };

        self.last_activity = Instant::now();
        if let Err(err) = write_frame(&mut link.writer, message.payload.as_bytes()).await {
            self.link = None;
            return Err(SendError::Io(err));
        }

        match timeout(ack_timeout, await_ack(&mut link.reader, control_id)).await {
            Ok(Ok(ack)) => {
                self.last_activity = Instant::now();
                if ack.code.is_positive() {
                    Ok(())
                } else {
                    Err(SendError::Nack {
                        code: ack.code.to_string(),
                        control_id: control_id.to_string(),
                    })
                }
            }
            Ok(Err(err)) => {
                self.link = None;
                Err(err)
            }
            Err(_) => {
                self.link = None;
                Err(SendError::AckTimeout {
                    control_id: control_id.to_string(),
                    timeout: ack_timeout,
                })
            }
        }
    }

    async fn ensure_connected(&mut self) -> SendResult<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let destination = self.config.destination.as_str();
        let result = match timeout(
            self.config.retry.connect_timeout,
            TcpStream::connect(destination),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        };

        match result {
            Ok(stream) => {
                // Frames are small and latency matters more than throughput.
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "failed to set TCP_NODELAY");
                }
                let (reader, writer) = stream.into_split();
                self.link = Some(Link {
                    reader: FrameReader::new(reader),
                    writer,
                });
                self.connect_failures = 0;
                self.last_activity = Instant::now();
                if self.has_connected {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.metrics.mllp_reconnects.inc();
                    info!("reconnected to MLLP receiver");
                } else {
                    info!("connected to MLLP receiver");
                }
                self.has_connected = true;
                Ok(())
            }
            Err(err) => {
                self.connect_failures += 1;
                if self.connect_failures >= self.config.retry.max_connect_failures {
                    self.stats.unavailable.store(true, Ordering::Relaxed);
                    error!(
                        failures = self.connect_failures,
                        error = %err,
                        "MLLP receiver unavailable"
                    );
                    return Err(self.unavailable());
                }
                warn!(failures = self.connect_failures, error = %err, "MLLP connect failed");
                Err(SendError::Io(err))
            }
        }
    }

    fn unavailable(&self) -> SendError {
        SendError::Unavailable {
            destination: self.config.destination.clone(),
            failures: self.connect_failures,
        }
    }

    /// Writes an empty frame. Never waits for a reply.
    async fn keep_alive(&mut self) {
        self.last_activity = Instant::now();
        if self.stats.unavailable.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = self.ensure_connected().await {
            debug!(error = %err, "keep-alive could not connect");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match write_frame(&mut link.writer, &[]).await {
            Ok(()) => {
                self.stats.keep_alives.fetch_add(1, Ordering::Relaxed);
                self.metrics.mllp_keep_alives.inc();
                debug!("keep-alive sent");
            }
            Err(err) => {
                warn!(error = %err, "keep-alive failed, dropping connection");
                self.link = None;
            }
        }
    }
}

/// Reads frames until one acknowledges `control_id`. Anything else is skipped.
async fn await_ack(reader: &mut FrameReader<OwnedReadHalf>, control_id: &str) -> SendResult<Ack> {
    loop {
        let frame = reader
            .next_frame()
            .await
            .map_err(|err| SendError::Frame(err.to_string()))?
            .ok_or_else(|| {
                SendError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "receiver closed the connection",
                ))
            })?;
        let text = String::from_utf8_lossy(&frame);
        if text.trim().is_empty() {
            continue;
        }
        match Ack::parse(&text) {
            Ok(ack) if ack.acknowledges(control_id) => return Ok(ack),
            Ok(ack) => debug!(expected = control_id, got = %ack.control_id, "skipping unrelated ACK"),
            Err(err) => debug!(error = %err, "skipping frame that is not an ACK"),
        }
    }
}
