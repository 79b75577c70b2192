/// Firehose subscription client
///
/// Owns the upstream WebSocket, the reconnect budget and the hand-off of
/// every binary frame to the decoder and processor. Frames are handled one
/// at a time, so the persisted cursor always covers a fully-applied prefix
/// of the stream.
use crate::{
    config::AppViewConfig,
    firehose::{frame::decode_frame, processor::CommitProcessor},
    metrics,
    store::{Store, SyncState},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const SUBSCRIBE_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &AppViewConfig) -> Self {
        Self {
            base: Duration::from_millis(config.ingest.reconnect_base_ms),
            max_delay: Duration::from_millis(config.ingest.reconnect_max_delay_ms),
            max_attempts: config.ingest.reconnect_max_attempts,
        }
    }

    /// `min(base * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Shared view of ingest health, read by the health endpoint
#[derive(Debug, Default)]
pub struct IngestStatus {
    connected: AtomicBool,
    gave_up: AtomicBool,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
    last_seq: AtomicI64,
    backfilling: AtomicBool,
    backfilled_repos: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestSnapshot {
    pub connected: bool,
    pub gave_up: bool,
    pub reconnect_attempts: u32,
    pub frames_received: u64,
    pub last_seq: Option<i64>,
    pub backfilling: bool,
    /// Repos finished by the current or last backfill run
    pub backfilled_repos: u64,
}

impl IngestStatus {
    pub fn snapshot(&self) -> IngestSnapshot {
        let last_seq = self.last_seq.load(Ordering::Relaxed);
        IngestSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            gave_up: self.gave_up.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            last_seq: (last_seq > 0).then_some(last_seq),
            backfilling: self.backfilling.load(Ordering::Relaxed),
            backfilled_repos: self.backfilled_repos.load(Ordering::Relaxed),
        }
    }

    pub fn set_backfilling(&self, running: bool) {
        self.backfilling.store(running, Ordering::Relaxed);
    }

    pub fn record_backfilled_repo(&self) {
        self.backfilled_repos.fetch_add(1, Ordering::Relaxed);
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        metrics::set_connected(connected);
    }
}

/// Sequence to resume after, if any
///
/// Before the first live frame of a backfilled index this is 0, replaying the
/// upstream's retained window so commits made during the backfill are not lost.
fn resume_cursor(state: &SyncState) -> Option<i64> {
    state
        .pds_seq
        .or_else(|| state.backfill_completed_at.as_ref().map(|_| 0))
}

/// How a connected session ended
enum SessionEnd {
    Shutdown,
    Closed,
    Failed,
}

pub struct FirehoseClient {
    ws_base: String,
    store: Store,
    processor: CommitProcessor,
    policy: ReconnectPolicy,
    status: Arc<IngestStatus>,
}

/// Running client; dropping it without `stop` leaves the task running
pub struct FirehoseHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FirehoseHandle {
    /// Close the socket and wait for the client task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Firehose task ended abnormally: {}", e);
        }
    }
}

impl FirehoseClient {
    pub fn new(config: &AppViewConfig, store: Store, status: Arc<IngestStatus>) -> Self {
        Self {
            ws_base: config.pds_ws_url(),
            processor: CommitProcessor::new(store.clone()),
            store,
            policy: ReconnectPolicy::from_config(config),
            status,
        }
    }

    /// Subscription URL, resuming after `cursor` when one is known
    pub fn subscribe_url(&self, cursor: Option<i64>) -> String {
        match cursor {
            Some(seq) => format!("{}{}?cursor={}", self.ws_base, SUBSCRIBE_PATH, seq),
            None => format!("{}{}", self.ws_base, SUBSCRIBE_PATH),
        }
    }

    /// Spawn the client task
    pub fn start(self) -> FirehoseHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        FirehoseHandle { shutdown, task }
    }

    /// Connect, consume and reconnect until shutdown or until the retry budget is spent
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cursor = match self.store.sync_state().await {
                Ok(state) => resume_cursor(&state),
                Err(e) => {
                    warn!("Failed to read sync cursor: {}", e);
                    None
                }
            };
            let url = self.subscribe_url(cursor);
            info!(url = %url, "Connecting to firehose");

            let connected = tokio::select! {
                result = connect_async(url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    info!("✓ Connected to firehose");
                    attempts = 0;
                    self.status.reconnect_attempts.store(0, Ordering::Relaxed);
                    self.status.set_connected(true);

                    let end = self.consume(ws_stream, &mut shutdown).await;
                    self.status.set_connected(false);

                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                    info!("Disconnected from firehose");
                }
                Err(e) => {
                    warn!("Failed to connect to firehose: {}", e);
                }
            }

            if attempts >= self.policy.max_attempts {
                error!(
                    attempts,
                    "Firehose reconnect budget exhausted; ingest stopped, serving existing data"
                );
                self.status.gave_up.store(true, Ordering::Relaxed);
                break;
            }

            let delay = self.policy.delay_for(attempts);
            attempts += 1;
            self.status.reconnect_attempts.store(attempts, Ordering::Relaxed);
            metrics::record_reconnect();
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Reconnecting to firehose");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Firehose client stopped");
    }

    async fn consume(
        &self,
        mut ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                msg = ws_stream.next() => match msg {
                    Some(Ok(Message::Binary(data))) => self.handle_message(&data).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_stream.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            return SessionEnd::Failed;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Firehose closed connection");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        return SessionEnd::Failed;
                    }
                    None => return SessionEnd::Closed,
                },
                _ = shutdown.changed() => {
                    if let Err(e) = ws_stream.close(None).await {
                        debug!("Error closing firehose socket: {}", e);
                    }
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Decode and apply one binary message; failures never escape
    pub async fn handle_message(&self, data: &[u8]) {
        self.status.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_frame_dropped();
                warn!(
                    len = data.len(),
                    head = %hex::encode(&data[..data.len().min(16)]),
                    error = %e,
                    "Dropping undecodable frame"
                );
                return;
            }
        };

        match self.processor.apply_frame(&frame).await {
            Ok(_) => {
                if let Some(seq) = frame.seq() {
                    self.status.last_seq.store(seq, Ordering::Relaxed);
                }
            }
            Err(e) => error!(seq = ?frame.seq(), error = %e, "Failed to persist firehose cursor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::testing::{commit_frame, post_record, TestBlock, TestOp};
    use crate::store::tests::{test_store, ALICE};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_subscribe_url() {
        let (store, _dir) = test_store().await;
        let mut config = AppViewConfig::default();
        config.upstream.pds_url = "https://pds.example.com".to_string();
        let client = FirehoseClient::new(&config, store, Arc::new(IngestStatus::default()));

        assert_eq!(
            client.subscribe_url(None),
            "wss://pds.example.com/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            client.subscribe_url(Some(42)),
            "wss://pds.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=42"
        );
    }

    #[test]
    fn test_resume_cursor() {
        let mut state = SyncState::default();
        assert_eq!(resume_cursor(&state), None);

        state.backfill_completed_at = Some("2024-05-01T12:00:00.000Z".to_string());
        assert_eq!(resume_cursor(&state), Some(0));

        state.pds_seq = Some(42);
        assert_eq!(resume_cursor(&state), Some(42));
    }

    #[tokio::test]
    async fn test_first_connect_after_backfill_replays_window() {
        let (store, _dir) = test_store().await;
        store.mark_backfill_complete().await.unwrap();

        let block = TestBlock::new(&post_record("during backfill", "2024-05-01T12:00:00Z"));
        let frames = vec![commit_frame(
            1,
            ALICE,
            "rev1",
            &[TestOp::create("app.bsky.feed.post/p1", block.cid)],
            &[&block],
        )];
        let (url, mut uris) = fake_upstream(frames).await;

        let mut config = AppViewConfig::default();
        config.upstream.pds_url = url;
        config.ingest.reconnect_max_attempts = 0;

        let client = FirehoseClient::new(&config, store.clone(), Arc::new(IngestStatus::default()));
        let (_shutdown, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(10), client.run(rx))
            .await
            .expect("client should stop after one session");

        let first_uri = uris.recv().await.unwrap();
        assert!(first_uri.ends_with("?cursor=0"), "{}", first_uri);
        assert_eq!(store.stats().await.unwrap().posts, 1);
        assert_eq!(store.sync_state().await.unwrap().pds_seq, Some(1));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_dropped() {
        let (store, _dir) = test_store().await;
        let status = Arc::new(IngestStatus::default());
        let client = FirehoseClient::new(&AppViewConfig::default(), store.clone(), status.clone());

        client.handle_message(&[0xde, 0xad, 0xbe, 0xef]).await;

        assert_eq!(status.snapshot().frames_received, 1);
        assert_eq!(store.sync_state().await.unwrap().pds_seq, None);
    }

    #[tokio::test]
    async fn test_deeply_nested_frame_is_dropped() {
        let (store, _dir) = test_store().await;
        let status = Arc::new(IngestStatus::default());
        let client = FirehoseClient::new(&AppViewConfig::default(), store.clone(), status.clone());

        let mut nested = vec![0x81; 20_000];
        nested.push(0x00);
        client.handle_message(&nested).await;

        // The client keeps working after the bad frame
        let block = TestBlock::new(&post_record("after", "2024-05-01T12:00:00Z"));
        client
            .handle_message(&commit_frame(
                3,
                ALICE,
                "rev3",
                &[TestOp::create("app.bsky.feed.post/p1", block.cid)],
                &[&block],
            ))
            .await;

        assert_eq!(status.snapshot().frames_received, 2);
        assert_eq!(status.snapshot().last_seq, Some(3));
        assert_eq!(store.stats().await.unwrap().posts, 1);
    }

    /// Serve two connections, then refuse further ones
    async fn fake_upstream(frames: Vec<Vec<u8>>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let accept = |stream: TcpStream| {
                let uri_tx = uri_tx.clone();
                let callback = move |req: &Request, resp: Response| {
                    let _ = uri_tx.send(req.uri().to_string());
                    Ok::<_, ErrorResponse>(resp)
                };
                tokio_tungstenite::accept_hdr_async(stream, callback)
            };

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Binary(frame)).await.unwrap();
            }
            let _ = ws.close(None).await;

            let (stream, _) = listener.accept().await.unwrap();
            drop(listener);
            let mut ws = accept(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        (format!("http://{}", addr), uri_rx)
    }

    #[tokio::test]
    async fn test_ingest_resumes_from_cursor_and_gives_up() {
        let (store, _dir) = test_store().await;

        let first = TestBlock::new(&post_record("one", "2024-05-01T12:00:00Z"));
        let second = TestBlock::new(&post_record("two", "2024-05-01T12:01:00Z"));
        let frames = vec![
            commit_frame(1, ALICE, "rev1", &[TestOp::create("app.bsky.feed.post/p1", first.cid)], &[&first]),
            vec![0xff, 0xff],
            commit_frame(2, ALICE, "rev2", &[TestOp::create("app.bsky.feed.post/p2", second.cid)], &[&second]),
        ];
        let (url, mut uris) = fake_upstream(frames).await;

        let mut config = AppViewConfig::default();
        config.upstream.pds_url = url;
        config.ingest.reconnect_base_ms = 5;
        config.ingest.reconnect_max_delay_ms = 20;
        config.ingest.reconnect_max_attempts = 2;

        let status = Arc::new(IngestStatus::default());
        let client = FirehoseClient::new(&config, store.clone(), status.clone());
        let (_shutdown, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(10), client.run(rx))
            .await
            .expect("client should give up once the upstream disappears");

        assert_eq!(store.stats().await.unwrap().posts, 2);
        let state = store.sync_state().await.unwrap();
        assert_eq!(state.pds_cursor.as_deref(), Some("rev2"));
        assert_eq!(state.pds_seq, Some(2));

        let snapshot = status.snapshot();
        assert!(snapshot.gave_up);
        assert!(!snapshot.connected);
        assert_eq!(snapshot.frames_received, 3);

        let first_uri = uris.recv().await.unwrap();
        let second_uri = uris.recv().await.unwrap();
        assert!(!first_uri.contains("cursor="));
        assert!(second_uri.ends_with("?cursor=2"), "{}", second_uri);
    }

    #[tokio::test]
    async fn test_stop_closes_client() {
        let (store, _dir) = test_store().await;
        let mut config = AppViewConfig::default();
        // Nothing listens here; the client sits in backoff until stopped
        config.upstream.pds_url = "http://127.0.0.1:9".to_string();
        config.ingest.reconnect_base_ms = 60_000;
        config.ingest.reconnect_max_delay_ms = 60_000;

        let handle = FirehoseClient::new(&config, store, Arc::new(IngestStatus::default())).start();
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should interrupt the backoff sleep");
    }
}
