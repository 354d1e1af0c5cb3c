//! Long-lived text-frame sessions closed by a hard timeout.
//!
//! A session opens a connection, sends a login frame, waits for a frame
//! containing the acknowledgment marker, then sends its follow-up frames
//! (typically a subscribe and a data frame). Connecting is bounded by its own
//! `connect_timeout`. Once the connection is open, whatever the protocol
//! state, the session is torn down after `hard_timeout`:
//!
//! ```text
//! Opening -> AwaitAck -> SubscribedAndSent -> Closed
//!     \           \                            ^
//!      `-----------`--- timeout / error -------'
//! ```
//!
//! Hitting the timeout is the expected way a session ends, not a failure.
//! Frames are opaque strings; nothing here parses them beyond a substring
//! match for the marker.
use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, timeout, timeout_at};
use typed_builder::TypedBuilder;

use crate::{
    context::IterationContext,
    metric::{Sample, SessionRecord, Tags},
};

/// Upper bound on the best-effort close once a session is over.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(e: impl fmt::Display) -> Self {
        Self(e.to_string())
    }
}

/// A connected, frame-oriented duplex channel.
pub trait FrameTransport: Send {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// The next inbound text frame, or `None` once the peer closed.
    fn next_frame(&mut self)
    -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Opens [`FrameTransport`]s. Shared by every iteration of a scenario.
pub trait Connector: Send + Sync {
    type Transport: FrameTransport;

    fn connect(&self, url: &str)
    -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplexState {
    Opening,
    AwaitAck,
    SubscribedAndSent,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum CloseReason {
    Timeout,
    RemoteClosed,
    Error(String),
}

/// What a session sends and how long it may live.
#[derive(Debug, Clone, TypedBuilder)]
pub struct DuplexPlan {
    #[builder(setter(into))]
    pub url: String,
    /// Sent as soon as the connection is open.
    #[builder(setter(into))]
    pub login: String,
    /// Substring identifying the acknowledgment frame.
    #[builder(default = "CONNECTED".to_owned(), setter(into))]
    pub ack_marker: String,
    /// Sent in order once the acknowledgment arrived.
    #[builder(default)]
    pub after_ack: Vec<String>,
    /// How long the session stays open, measured from the moment the
    /// connection is established.
    pub hard_timeout: Duration,
    /// Bound on opening the connection; hitting it counts as a failed connect.
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    #[builder(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Always [`DuplexState::Closed`].
    pub state: DuplexState,
    /// The last state before closing.
    pub reached: DuplexState,
    pub reason: CloseReason,
    pub connected: bool,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub duration: Duration,
}

impl SessionOutcome {
    pub fn acknowledged(&self) -> bool {
        self.reached == DuplexState::SubscribedAndSent
    }
}

#[derive(Debug)]
struct Progress {
    state: DuplexState,
    sent: u64,
    received: u64,
}

/// Runs one session to `Closed` and records a `SessionRecord`.
///
/// Never fails: connection errors and remote closes are reported in the
/// outcome and the record, leaving the iteration's own outcome untouched.
pub async fn run_session<D, C: Connector>(
    ctx: &IterationContext<D>,
    connector: &C,
    plan: &DuplexPlan,
) -> SessionOutcome {
    let started = Instant::now();
    let mut progress = Progress {
        state: DuplexState::Opening,
        sent: 0,
        received: 0,
    };

    let connecting = timeout(plan.connect_timeout, connector.connect(&plan.url));
    let (reason, connected) = match connecting.await {
        Err(_) => (CloseReason::Timeout, false),
        Ok(Err(e)) => (CloseReason::Error(e.0), false),
        Ok(Ok(mut transport)) => {
            let deadline = Instant::now() + plan.hard_timeout;
            let reason = timeout_at(deadline, drive(&mut transport, plan, &mut progress))
                .await
                .unwrap_or(CloseReason::Timeout);
            match timeout(CLOSE_GRACE, transport.close()).await {
                Ok(Err(e)) => tracing::debug!("Closing {} failed: {e}", plan.url),
                Err(_) => tracing::debug!("Closing {} timed out", plan.url),
                Ok(Ok(())) => {}
            }
            (reason, true)
        }
    };

    let outcome = SessionOutcome {
        state: DuplexState::Closed,
        reached: progress.state,
        reason,
        connected,
        frames_sent: progress.sent,
        frames_received: progress.received,
        duration: started.elapsed(),
    };
    tracing::debug!(
        "Session {} closed ({:?}) after {:?} in {:?}",
        plan.url,
        outcome.reason,
        outcome.duration,
        outcome.reached
    );
    ctx.sink().record(Sample::Session(SessionRecord {
        tags: ctx.tags.merged(&plan.tags),
        connected,
        acknowledged: outcome.acknowledged(),
        frames_sent: outcome.frames_sent,
        frames_received: outcome.frames_received,
        duration: outcome.duration,
    }));
    outcome
}

/// Runs the protocol until the peer goes away; the caller enforces the deadline.
async fn drive<T: FrameTransport>(
    transport: &mut T,
    plan: &DuplexPlan,
    progress: &mut Progress,
) -> CloseReason {
    if let Err(e) = transport.send(plan.login.clone()).await {
        return CloseReason::Error(e.0);
    }
    progress.sent += 1;
    progress.state = DuplexState::AwaitAck;

    loop {
        let frame = match transport.next_frame().await {
            None => return CloseReason::RemoteClosed,
            Some(Err(e)) => return CloseReason::Error(e.0),
            Some(Ok(frame)) => frame,
        };
        progress.received += 1;
        if progress.state != DuplexState::AwaitAck || !frame.contains(&plan.ack_marker) {
            continue;
        }
        for follow_up in &plan.after_ack {
            if let Err(e) = transport.send(follow_up.clone()).await {
                return CloseReason::Error(e.0);
            }
            progress.sent += 1;
        }
        progress.state = DuplexState::SubscribedAndSent;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::{sync::mpsc, task::JoinHandle};

    use super::*;
    use crate::{
        context::{RunContext, ShortfallPolicy},
        iteration::{IterationRunner, action},
        metric::IterationOutcome,
        metrics::{LiveMetrics, spawn_aggregator},
    };

    /// In-memory transport: frames we send go to `outbound`, frames the
    /// test pushes into `inbound` are what we receive.
    struct ChannelTransport {
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    }

    impl FrameTransport for ChannelTransport {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.outbound.send(frame).map_err(TransportError::new)
        }

        async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.inbound.close();
            Ok(())
        }
    }

    /// Hands out a single pre-wired transport, then refuses.
    struct ChannelConnector(Mutex<Option<ChannelTransport>>);

    impl Connector for ChannelConnector {
        type Transport = ChannelTransport;

        async fn connect(&self, _url: &str) -> Result<ChannelTransport, TransportError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError("connection refused".into()))
        }
    }

    /// A connector plus the peer's ends: what we sent, and where to push frames.
    fn wire() -> (
        ChannelConnector,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            outbound: out_tx,
            inbound: in_rx,
        };
        (
            ChannelConnector(Mutex::new(Some(transport))),
            out_rx,
            in_tx,
        )
    }

    fn plan() -> DuplexPlan {
        DuplexPlan::builder()
            .url("ws://chat.test/ws")
            .login("CONNECT\n\n\0")
            .after_ack(vec!["SUBSCRIBE\n\n\0".into(), "SEND\n\nhi\0".into()])
            .hard_timeout(Duration::from_millis(1_000))
            .build()
    }

    fn context() -> (Arc<RunContext<()>>, LiveMetrics, JoinHandle<()>) {
        let live = LiveMetrics::default();
        let (sink, aggregator) = spawn_aggregator(live.clone(), 16);
        (
            Arc::new(RunContext::new(Arc::new(()), sink, ShortfallPolicy::Advisory)),
            live,
            aggregator,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_still_closes_on_timeout_as_a_completed_iteration() {
        let (run, _, _) = context();
        let (connector, mut sent, _peer) = wire();
        let connector = Arc::new(connector);
        let outcome = Arc::new(Mutex::new(None));

        let seen = outcome.clone();
        let act = action(move |ctx| {
            let (connector, seen) = (connector.clone(), seen.clone());
            async move {
                let result = run_session(&ctx, connector.as_ref(), &plan()).await;
                *seen.lock().unwrap() = Some(result);
                Ok(())
            }
        });
        let runner = IterationRunner::new(run, act, "chat", Tags::new());

        assert_eq!(runner.run(1).await, IterationOutcome::Success);
        let outcome = outcome.lock().unwrap().take().unwrap();
        assert_eq!(outcome.state, DuplexState::Closed);
        assert_eq!(outcome.reached, DuplexState::AwaitAck);
        assert_eq!(outcome.reason, CloseReason::Timeout);
        assert!(outcome.connected);
        assert!(outcome.duration >= Duration::from_millis(1_000));
        assert_eq!(sent.recv().await.as_deref(), Some("CONNECT\n\n\0"));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_triggers_follow_ups_and_early_frames_are_ignored() {
        let (run, _, _) = context();
        let (connector, mut sent, peer) = wire();
        let ctx = IterationContext::new(
            0,
            0,
            1,
            "chat".into(),
            Tags::new().with("scenario", "chat"),
            run.fixture().clone(),
            run.sink().clone(),
            Default::default(),
        );

        peer.send("MESSAGE\n\nstale\0".into()).unwrap();
        let session = tokio::spawn({
            let plan = plan();
            async move { run_session(&ctx, &connector, &plan).await }
        });

        assert_eq!(sent.recv().await.as_deref(), Some("CONNECT\n\n\0"));
        // The stale frame arrived first and changed nothing
        assert!(sent.try_recv().is_err());
        peer.send("CONNECTED\nversion:1.2\n\n\0".into()).unwrap();
        assert_eq!(sent.recv().await.as_deref(), Some("SUBSCRIBE\n\n\0"));
        assert_eq!(sent.recv().await.as_deref(), Some("SEND\n\nhi\0"));
        // A second ack does not replay the follow-ups
        peer.send("CONNECTED\n\n\0".into()).unwrap();

        let outcome = session.await.unwrap();
        assert!(outcome.acknowledged());
        assert_eq!(outcome.reason, CloseReason::Timeout);
        assert_eq!(outcome.frames_sent, 3);
        assert_eq!(outcome.frames_received, 3);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_and_refused_connections_end_in_closed() {
        let (run, live, aggregator) = context();
        let (connector, _sent, peer) = wire();
        let act = {
            let connector = Arc::new(connector);
            action(move |ctx| {
                let connector = connector.clone();
                async move {
                    let outcome = run_session(&ctx, connector.as_ref(), &plan()).await;
                    assert_eq!(outcome.state, DuplexState::Closed);
                    Ok(())
                }
            })
        };
        let runner = IterationRunner::new(run.clone(), act, "chat", Tags::new());

        drop(peer);
        assert_eq!(runner.run(1).await, IterationOutcome::Success);
        // The connector is spent, so the second session never connects
        assert_eq!(runner.run(1).await, IterationOutcome::Success);

        drop(runner);
        drop(run);
        aggregator.await.unwrap();
        let stats = live.read().await.sessions_matching(&Tags::new());
        assert_eq!(stats.connect_failed.total, 2);
        assert_eq!(stats.connect_failed.hits, 1);
    }

    /// Takes `delay` to open every connection.
    struct SlowConnector {
        inner: ChannelConnector,
        delay: Duration,
    }

    impl Connector for SlowConnector {
        type Transport = ChannelTransport;

        async fn connect(&self, url: &str) -> Result<ChannelTransport, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect(url).await
        }
    }

    fn session_context(run: &RunContext<()>) -> IterationContext<()> {
        IterationContext::new(
            0,
            0,
            1,
            "chat".into(),
            Tags::new(),
            run.fixture().clone(),
            run.sink().clone(),
            Default::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handshake_does_not_eat_into_the_session() {
        let (run, _, _) = context();
        let (inner, mut sent, peer) = wire();
        let connector = SlowConnector {
            inner,
            delay: Duration::from_millis(900),
        };
        let ctx = session_context(&run);
        let session = tokio::spawn(async move { run_session(&ctx, &connector, &plan()).await });

        assert_eq!(sent.recv().await.as_deref(), Some("CONNECT\n\n\0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.send("CONNECTED\n\n\0".into()).unwrap();

        let outcome = session.await.unwrap();
        assert!(outcome.connected);
        assert!(outcome.acknowledged());
        assert_eq!(outcome.reason, CloseReason::Timeout);
        // 900ms to connect, then the full second open
        assert!(outcome.duration >= Duration::from_millis(1_900), "{:?}", outcome.duration);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_slower_than_its_bound_is_a_failed_connect() {
        let (run, _, _) = context();
        let (inner, _sent, _peer) = wire();
        let connector = SlowConnector {
            inner,
            delay: Duration::from_secs(3),
        };
        let plan = DuplexPlan::builder()
            .url("ws://chat.test/ws")
            .login("CONNECT\n\n\0")
            .hard_timeout(Duration::from_secs(1))
            .connect_timeout(Duration::from_secs(2))
            .build();

        let outcome = run_session(&session_context(&run), &connector, &plan).await;
        assert!(!outcome.connected);
        assert_eq!(outcome.reached, DuplexState::Opening);
        assert_eq!(outcome.reason, CloseReason::Timeout);
        assert!(outcome.duration >= Duration::from_secs(2));
        assert!(outcome.duration < Duration::from_secs(3), "{:?}", outcome.duration);
    }
}
