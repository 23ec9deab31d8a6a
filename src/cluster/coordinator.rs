//! The coordinator side of the cluster protocol.
//!
//! One coordinator owns the real counters for every worker connected to it,
//! one in-memory limiter per key prefix.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::link::{ClusterError, Link};
use super::message::{CallData, ClusterMessage, Func, InitOptions, Packet, Reply, ReplyData};
use crate::error::{Rejection, Result};
use crate::ratelimit::{MemoryRateLimiter, RateLimiter, RateLimiterRes, StoreLimiter};

/// Holds the shared limiters and answers worker calls.
///
/// Create one per coordinating process and hand it to whatever accepts
/// worker links.
///
/// Each call runs on its own task, so calls arriving on one link may be
/// applied and answered out of arrival order.
pub struct Coordinator {
    channel: String,
    limiters: DashMap<String, Arc<MemoryRateLimiter>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("channel", &self.channel)
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl Coordinator {
    /// Create a coordinator answering packets tagged with `channel`.
    pub fn new(channel: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.into(),
            limiters: DashMap::new(),
        })
    }

    /// The channel tag this coordinator answers.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The limiter for `key_prefix`, if a worker announced it.
    pub fn limiter(&self, key_prefix: &str) -> Option<Arc<MemoryRateLimiter>> {
        self.limiters.get(key_prefix).map(|l| Arc::clone(l.value()))
    }

    /// Number of limiters created so far.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    /// Open an in-process link to this coordinator.
    pub fn connect(self: &Arc<Self>) -> Link {
        let (ours, theirs) = Link::pair();
        self.attach(ours);
        theirs
    }

    /// Serve one worker link until it closes.
    pub fn attach(self: &Arc<Self>, link: Link) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_link(link).await })
    }

    /// Accept worker connections over TCP until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> std::result::Result<(), ClusterError>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = listener.local_addr().map_err(ClusterError::Bind)?;
        info!(addr = %addr, channel = %self.channel, "Coordinator listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %addr, "Coordinator shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted worker connection");
                        self.attach(Link::from_stream(stream));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept worker connection"),
                },
            }
        }
        Ok(())
    }

    async fn run_link(self: Arc<Self>, link: Link) {
        let link_id = Uuid::new_v4();
        debug!(link = %link_id, "Worker link attached");

        let (tx, mut rx) = link.split();
        while let Some(packet) = rx.recv().await {
            if packet.channel != self.channel {
                trace!(link = %link_id, channel = %packet.channel, "Ignoring packet from another channel");
                continue;
            }
            match packet.decode() {
                Ok(ClusterMessage::Init(opts)) => self.handle_init(opts, &tx),
                Ok(ClusterMessage::Call {
                    key_prefix,
                    id,
                    func,
                    data,
                }) => self.handle_call(key_prefix, id, func, data, &tx),
                Ok(other) => trace!(link = %link_id, message = ?other, "Ignoring message meant for workers"),
                Err(e) => warn!(link = %link_id, error = %e, "Malformed cluster message"),
            }
        }

        debug!(link = %link_id, "Worker link closed");
    }

    fn handle_init(&self, opts: InitOptions, tx: &UnboundedSender<Packet>) {
        let key_prefix = opts.key_prefix.clone();
        if !self.limiters.contains_key(&key_prefix) {
            let limiter = match StoreLimiter::in_memory(opts.into()) {
                Ok(limiter) => limiter,
                Err(e) => {
                    warn!(key_prefix = %key_prefix, error = %e, "Refusing worker limiter options");
                    return;
                }
            };
            self.limiters
                .entry(key_prefix.clone())
                .or_insert_with(|| {
                    info!(key_prefix = %key_prefix, "Created shared limiter");
                    Arc::new(limiter)
                });
        }

        let ack = ClusterMessage::InitAck { key_prefix }.into_packet(&self.channel);
        if tx.send(ack).is_err() {
            debug!("Worker link closed before init ack");
        }
    }

    fn handle_call(&self, key_prefix: String, id: String, func: Func, data: CallData, tx: &UnboundedSender<Packet>) {
        let Some(limiter) = self.limiter(&key_prefix) else {
            debug!(key_prefix = %key_prefix, id = %id, "Ignoring call for unknown key prefix");
            return;
        };

        // Calls run on their own task so even-spacing delays do not hold up the link.
        let tx = tx.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            trace!(key_prefix = %key_prefix, id = %id, func = %func, key = %data.key, "Running call");
            let reply = run_call(limiter.as_ref(), func, &data).await;
            let packet = ClusterMessage::Reply { key_prefix, id, reply }.into_packet(&channel);
            if tx.send(packet).is_err() {
                debug!("Worker link closed before reply");
            }
        });
    }
}

async fn run_call(limiter: &dyn RateLimiter, func: Func, data: &CallData) -> Reply {
    let key = data.key.as_str();
    let opts = &data.options;
    let points = data.points_to_consume.max(0) as u64;
    let sec_duration = data.sec_duration.unwrap_or(0);

    match func {
        Func::Consume => match limiter.consume(key, points, opts).await {
            Ok(res) => Reply::resolve(Some(ReplyData::Res(res))),
            Err(Rejection::Limited(res)) => Reply::reject(Some(ReplyData::Res(res))),
            Err(Rejection::Failed(e)) => Reply::failed(e.to_string()),
        },
        Func::Penalty => res_reply(limiter.penalty(key, points, opts).await),
        Func::Reward => res_reply(limiter.reward(key, points, opts).await),
        Func::Set => res_reply(limiter.set(key, data.points_to_consume, sec_duration, opts).await),
        Func::Block => res_reply(limiter.block(key, sec_duration, opts).await),
        Func::Get => match limiter.get(key, opts).await {
            Ok(res) => Reply::resolve(res.map(ReplyData::Res)),
            Err(e) => Reply::failed(e.to_string()),
        },
        Func::Delete => match limiter.delete(key, opts).await {
            Ok(deleted) => Reply::resolve(Some(ReplyData::Deleted { deleted })),
            Err(e) => Reply::failed(e.to_string()),
        },
    }
}

fn res_reply(result: Result<RateLimiterRes>) -> Reply {
    match result {
        Ok(res) => Reply::resolve(Some(ReplyData::Res(res))),
        Err(e) => Reply::failed(e.to_string()),
    }
}
