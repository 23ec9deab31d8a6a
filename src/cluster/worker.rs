//! The worker side of the cluster protocol.
//!
//! A [`ClusterClient`] owns the process's link to the coordinator and routes
//! replies. Each [`ClusterWorker`] is a limiter whose counters live in the
//! coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::link::{ClusterError, Link};
use super::message::{CallData, ClusterMessage, Func, InitOptions, Packet, Reply, ReplyData, ReplyKind};
use crate::error::{LimiterError, Rejection, Result};
use crate::ratelimit::{signed_points, CallOptions, LimiterOptions, RateLimiter, RateLimiterRes};

/// How long a call waits for the coordinator by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a call checks whether the coordinator acknowledged init.
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(30);

type PendingReply = oneshot::Sender<std::result::Result<Reply, ClusterError>>;

#[derive(Default)]
struct WorkerState {
    initialized: AtomicBool,
    pending: DashMap<String, PendingReply>,
}

impl WorkerState {
    /// Register a pending call under a fresh correlation id.
    fn register_call(&self) -> (String, oneshot::Receiver<std::result::Result<Reply, ClusterError>>) {
        let (tx, rx) = oneshot::channel();
        let mut id = clock_id();
        loop {
            match self.pending.entry(id) {
                Entry::Vacant(vacant) => {
                    let id = vacant.key().clone();
                    vacant.insert(tx);
                    return (id, rx);
                }
                Entry::Occupied(occupied) => {
                    id = format!("{}{}", occupied.key(), rand::random::<u32>());
                }
            }
        }
    }

    fn complete(&self, id: &str, reply: std::result::Result<Reply, ClusterError>) {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => trace!(id = %id, "Dropping reply for a call that is no longer pending"),
        }
    }
}

fn clock_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
        .to_string()
}

struct ClientShared {
    id: Uuid,
    channel: String,
    tx: UnboundedSender<Packet>,
    workers: DashMap<String, Arc<WorkerState>>,
}

/// A process's connection to the coordinator, shared by its workers.
#[derive(Clone)]
pub struct ClusterClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("id", &self.shared.id)
            .field("channel", &self.shared.channel)
            .finish()
    }
}

impl ClusterClient {
    /// Use `link` to talk to the coordinator on `channel`.
    pub fn new(link: Link, channel: impl Into<String>) -> Self {
        let (tx, rx) = link.split();
        let shared = Arc::new(ClientShared {
            id: Uuid::new_v4(),
            channel: channel.into(),
            tx,
            workers: DashMap::new(),
        });
        debug!(client = %shared.id, channel = %shared.channel, "Cluster client started");
        tokio::spawn(dispatch(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    /// Connect to a coordinator over TCP.
    pub async fn connect<A: ToSocketAddrs>(addr: A, channel: impl Into<String>) -> std::result::Result<Self, ClusterError> {
        Ok(Self::new(Link::connect(addr).await?, channel))
    }

    /// This client's id, for log correlation.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    fn register(&self, key_prefix: &str) -> Arc<WorkerState> {
        let state = self.shared.workers.entry(key_prefix.to_string()).or_default();
        Arc::clone(state.value())
    }

    fn send(&self, message: ClusterMessage) -> std::result::Result<(), ClusterError> {
        self.shared
            .tx
            .send(message.into_packet(&self.shared.channel))
            .map_err(|_| ClusterError::Disconnected)
    }
}

/// Route coordinator packets to the workers waiting for them.
async fn dispatch(shared: Weak<ClientShared>, mut rx: UnboundedReceiver<Packet>) {
    while let Some(packet) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if packet.channel != shared.channel {
            trace!(channel = %packet.channel, "Ignoring packet from another channel");
            continue;
        }

        match packet.decode() {
            Ok(ClusterMessage::InitAck { key_prefix }) => {
                if let Some(worker) = shared.workers.get(&key_prefix) {
                    worker.initialized.store(true, Ordering::Release);
                    debug!(client = %shared.id, key_prefix = %key_prefix, "Coordinator acknowledged init");
                }
            }
            Ok(ClusterMessage::Reply { key_prefix, id, reply }) => {
                if let Some(worker) = shared.workers.get(&key_prefix) {
                    worker.complete(&id, Ok(reply));
                }
            }
            Ok(other) => trace!(message = ?other, "Ignoring message meant for the coordinator"),
            Err(ClusterError::UnknownMessageType {
                key_prefix: Some(key_prefix),
                id: Some(id),
                kind,
            }) => {
                warn!(key_prefix = %key_prefix, id = %id, kind = %kind, "Reply with unknown type");
                if let Some(worker) = shared.workers.get(&key_prefix) {
                    let err = ClusterError::UnknownMessageType {
                        key_prefix: Some(key_prefix.clone()),
                        id: Some(id.clone()),
                        kind,
                    };
                    worker.complete(&id, Err(err));
                }
            }
            Err(e) => warn!(error = %e, "Malformed cluster message"),
        }
    }

    // The link is gone. Dropping the senders fails every pending call.
    if let Some(shared) = shared.upgrade() {
        for worker in shared.workers.iter() {
            worker.pending.clear();
        }
        debug!(client = %shared.id, "Cluster client link closed");
    }
}

/// A limiter whose counters live in the coordinator.
pub struct ClusterWorker {
    options: LimiterOptions,
    timeout: Duration,
    client: ClusterClient,
    state: Arc<WorkerState>,
}

impl std::fmt::Debug for ClusterWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterWorker")
            .field("options", &self.options)
            .field("timeout", &self.timeout)
            .field("client", &self.client)
            .finish()
    }
}

impl ClusterWorker {
    /// Create a worker and announce its limiter to the coordinator.
    ///
    /// Calls made before the coordinator acknowledges wait for it.
    pub fn new(client: &ClusterClient, options: LimiterOptions) -> Result<Self> {
        options.validate()?;
        let state = client.register(&options.key_prefix);
        client.send(ClusterMessage::Init(InitOptions::from(&options)))?;
        debug!(client = %client.id(), key_prefix = %options.key_prefix, "Cluster worker created");

        Ok(Self {
            options,
            timeout: DEFAULT_TIMEOUT,
            client: client.clone(),
            state,
        })
    }

    /// Set how long calls wait for the coordinator.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the coordinator acknowledged this worker's limiter.
    pub fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::Acquire)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.state.pending.len()
    }

    async fn call(&self, func: Func, data: CallData) -> Result<Reply> {
        let (id, rx) = self.state.register_call();
        trace!(key_prefix = %self.options.key_prefix, id = %id, func = %func, "Sending call");

        let exchange = async {
            while !self.is_initialized() {
                tokio::time::sleep(INIT_POLL_INTERVAL).await;
            }
            self.client.send(ClusterMessage::Call {
                key_prefix: self.options.key_prefix.clone(),
                id: id.clone(),
                func,
                data,
            })?;
            rx.await.map_err(|_| ClusterError::Disconnected)?
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        self.state.pending.remove(&id);

        match outcome {
            Ok(reply) => Ok(reply?),
            Err(_) => {
                warn!(key_prefix = %self.options.key_prefix, id = %id, func = %func, "Call timed out");
                Err(ClusterError::Timeout(self.timeout).into())
            }
        }
    }
}

fn remote_failure(reply: Reply) -> LimiterError {
    match reply.error {
        Some(error) => ClusterError::Remote(error).into(),
        None => ClusterError::Protocol(format!("unexpected {:?} reply {:?}", reply.kind, reply.data)).into(),
    }
}

fn expect_res(reply: Reply) -> Result<RateLimiterRes> {
    match reply {
        Reply {
            kind: ReplyKind::Resolve,
            data: Some(ReplyData::Res(res)),
            ..
        } => Ok(res),
        reply => Err(remote_failure(reply)),
    }
}

#[async_trait]
impl RateLimiter for ClusterWorker {
    fn options(&self) -> &LimiterOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut LimiterOptions {
        &mut self.options
    }

    async fn consume(
        &self,
        key: &str,
        points: u64,
        opts: &CallOptions,
    ) -> std::result::Result<RateLimiterRes, Rejection> {
        let reply = self.call(Func::Consume, CallData::new(key, signed_points(points)?, opts)).await?;
        match reply {
            Reply {
                kind: ReplyKind::Resolve,
                data: Some(ReplyData::Res(res)),
                ..
            } => Ok(res),
            Reply {
                kind: ReplyKind::Reject,
                data: Some(ReplyData::Res(res)),
                ..
            } => Err(Rejection::Limited(res)),
            reply => Err(remote_failure(reply).into()),
        }
    }

    async fn penalty(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        expect_res(self.call(Func::Penalty, CallData::new(key, signed_points(points)?, opts)).await?)
    }

    async fn reward(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        expect_res(self.call(Func::Reward, CallData::new(key, signed_points(points)?, opts)).await?)
    }

    async fn get(&self, key: &str, opts: &CallOptions) -> Result<Option<RateLimiterRes>> {
        let reply = self.call(Func::Get, CallData::new(key, 0, opts)).await?;
        match reply {
            Reply {
                kind: ReplyKind::Resolve,
                data,
                error: None,
            } => match data {
                None => Ok(None),
                Some(ReplyData::Res(res)) => Ok(Some(res)),
                Some(other) => Err(ClusterError::Protocol(format!("unexpected get reply {:?}", other)).into()),
            },
            reply => Err(remote_failure(reply)),
        }
    }

    async fn set(&self, key: &str, points: i64, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let data = CallData::new(key, points, opts).with_sec_duration(sec_duration);
        expect_res(self.call(Func::Set, data).await?)
    }

    async fn block(&self, key: &str, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let data = CallData::new(key, 0, opts).with_sec_duration(sec_duration);
        expect_res(self.call(Func::Block, data).await?)
    }

    async fn delete(&self, key: &str, opts: &CallOptions) -> Result<bool> {
        let reply = self.call(Func::Delete, CallData::new(key, 0, opts)).await?;
        match reply {
            Reply {
                kind: ReplyKind::Resolve,
                data: Some(ReplyData::Deleted { deleted }),
                ..
            } => Ok(deleted),
            reply => Err(remote_failure(reply)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::DEFAULT_CHANNEL;
    use crate::cluster::Coordinator;
    use crate::ratelimit::{Insured, MemoryRateLimiter};
    use tokio::net::TcpListener;

    fn options(points: u64, duration: u64, key_prefix: &str) -> LimiterOptions {
        let mut options = LimiterOptions::new(points, duration);
        options.key_prefix = key_prefix.to_string();
        options
    }

    #[tokio::test]
    async fn test_workers_share_coordinator_counter() {
        let coordinator = Coordinator::new(DEFAULT_CHANNEL);
        let opts = CallOptions::default();

        // Two processes, each with its own link and worker.
        let first = ClusterClient::new(coordinator.connect(), DEFAULT_CHANNEL);
        let second = ClusterClient::new(coordinator.connect(), DEFAULT_CHANNEL);
        let worker_a = ClusterWorker::new(&first, options(2, 5, "shared")).unwrap();
        let worker_b = ClusterWorker::new(&second, options(2, 5, "shared")).unwrap();

        let res = worker_a.consume("x", 1, &opts).await.unwrap();
        assert_eq!(res.remaining_points, 1);
        let res = worker_b.consume("x", 1, &opts).await.unwrap();
        assert_eq!(res.remaining_points, 0);

        match worker_a.consume("x", 1, &opts).await {
            Err(Rejection::Limited(res)) => {
                assert_eq!(res.consumed_points, 3);
                assert_eq!(res.remaining_points, 0);
            }
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(coordinator.limiter_count(), 1);
        assert_eq!(worker_a.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_prefixes_are_separate() {
        let coordinator = Coordinator::new(DEFAULT_CHANNEL);
        let client = ClusterClient::new(coordinator.connect(), DEFAULT_CHANNEL);
        let opts = CallOptions::default();

        let login = ClusterWorker::new(&client, options(1, 5, "login")).unwrap();
        let api = ClusterWorker::new(&client, options(10, 5, "api")).unwrap();

        login.consume("user", 1, &opts).await.unwrap();
        let res = api.consume("user", 1, &opts).await.unwrap();
        assert_eq!(res.remaining_points, 9);
        assert!(login.consume("user", 1, &opts).await.is_err());
        assert_eq!(coordinator.limiter_count(), 2);
    }

    #[tokio::test]
    async fn test_full_verb_surface() {
        let coordinator = Coordinator::new(DEFAULT_CHANNEL);
        let client = ClusterClient::new(coordinator.connect(), DEFAULT_CHANNEL);
        let worker = ClusterWorker::new(&client, options(5, 60, "verbs")).unwrap();
        let opts = CallOptions::default();

        assert!(worker.get("k", &opts).await.unwrap().is_none());

        worker.consume("k", 2, &opts).await.unwrap();
        assert_eq!(worker.penalty("k", 2, &opts).await.unwrap().consumed_points, 4);
        assert_eq!(worker.reward("k", 3, &opts).await.unwrap().consumed_points, 1);
        assert_eq!(worker.get("k", &opts).await.unwrap().unwrap().remaining_points, 4);

        let res = worker.set("k", 4, 0, &opts).await.unwrap();
        assert_eq!(res.ms_before_next, -1);

        let res = worker.block("k", 30, &opts).await.unwrap();
        assert_eq!(res.consumed_points, 6);
        assert!(worker.consume("k", 1, &opts).await.is_err());

        assert!(worker.delete("k", &opts).await.unwrap());
        assert!(!worker.delete("k", &opts).await.unwrap());
        let res = worker.consume("k", 1, &opts).await.unwrap();
        assert!(res.is_first_in_duration);
    }

    #[tokio::test]
    async fn test_timeout_without_coordinator() {
        let (ours, theirs) = Link::pair();
        let client = ClusterClient::new(ours, DEFAULT_CHANNEL);
        let worker = ClusterWorker::new(&client, options(2, 5, "silent"))
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        match worker.consume("x", 1, &CallOptions::default()).await {
            Err(Rejection::Failed(LimiterError::Cluster(ClusterError::Timeout(timeout)))) => {
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!worker.is_initialized());
        assert_eq!(worker.pending_calls(), 0);
        drop(theirs);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_insurance() {
        let (ours, _theirs) = Link::pair();
        let client = ClusterClient::new(ours, DEFAULT_CHANNEL);
        let worker = ClusterWorker::new(&client, options(2, 5, "silent"))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let insurance = MemoryRateLimiter::in_memory(LimiterOptions::new(5, 2)).unwrap();
        let limiter = Insured::new(worker).with_insurance(insurance);

        let res = limiter.consume("x", 1, &CallOptions::default()).await.unwrap();
        assert_eq!(res.remaining_points, 4);
    }

    #[tokio::test]
    async fn test_unknown_reply_type_is_protocol_error() {
        let (ours, theirs) = Link::pair();
        let client = ClusterClient::new(ours, DEFAULT_CHANNEL);
        let worker = ClusterWorker::new(&client, options(2, 5, "odd")).unwrap();

        // A coordinator that acks init and answers calls with a bogus type.
        let (tx, mut rx) = theirs.split();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let mut reply = Packet {
                    channel: packet.channel.clone(),
                    key_prefix: Some("odd".to_string()),
                    ..Packet::default()
                };
                match packet.decode() {
                    Ok(ClusterMessage::Init(_)) => reply.kind = Some("init".to_string()),
                    Ok(ClusterMessage::Call { id, .. }) => {
                        reply.kind = Some("maybe".to_string());
                        reply.id = Some(id);
                    }
                    _ => continue,
                }
                let _ = tx.send(reply);
            }
        });

        match worker.consume("x", 1, &CallOptions::default()).await {
            Err(Rejection::Failed(LimiterError::Cluster(ClusterError::UnknownMessageType { kind, .. }))) => {
                assert_eq!(kind, "maybe");
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let (ours, theirs) = Link::pair();
        let client = ClusterClient::new(ours, DEFAULT_CHANNEL);
        let worker = ClusterWorker::new(&client, options(2, 5, "gone")).unwrap();

        // Ack init, then hang up.
        let (tx, mut rx) = theirs.split();
        tokio::spawn(async move {
            rx.recv().await;
            let ack = ClusterMessage::InitAck {
                key_prefix: "gone".to_string(),
            };
            let _ = tx.send(ack.into_packet(DEFAULT_CHANNEL));
            rx.recv().await;
        });

        match worker.consume("x", 1, &CallOptions::default()).await {
            Err(Rejection::Failed(LimiterError::Cluster(ClusterError::Disconnected))) => {}
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_over_tcp() {
        let coordinator = Coordinator::new(DEFAULT_CHANNEL);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(coordinator.clone().serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let client = ClusterClient::connect(addr, DEFAULT_CHANNEL).await.unwrap();
        let worker = ClusterWorker::new(&client, options(2, 5, "tcp")).unwrap();
        let opts = CallOptions::default();

        assert_eq!(worker.consume("x", 1, &opts).await.unwrap().remaining_points, 1);
        assert_eq!(worker.consume("x", 1, &opts).await.unwrap().remaining_points, 0);
        assert!(worker.consume("x", 1, &opts).await.is_err());
        assert!(worker.is_initialized());

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let state = WorkerState::default();
        let (a, _rx_a) = state.register_call();
        let (b, _rx_b) = state.register_call();
        assert_ne!(a, b);
        assert_eq!(state.pending.len(), 2);
    }
}
