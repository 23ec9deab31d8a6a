//! Cluster protocol messages.
//!
//! [`Packet`] is the wire shape, a flat JSON object tagged with a channel
//! name. [`ClusterMessage`] is its typed form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::link::ClusterError;
use crate::ratelimit::{CallOptions, LimiterOptions, RateLimiterRes};

/// Channel tag used when none is configured.
pub const DEFAULT_CHANNEL: &str = "ratekeeper";

const INIT: &str = "init";
const RESOLVE: &str = "resolve";
const REJECT: &str = "reject";

/// A packet as it travels over a [`Link`](super::Link).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub channel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<InitOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Limiter options a worker announces to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOptions {
    pub points: u64,
    pub duration: u64,
    #[serde(default)]
    pub exec_evenly: bool,
    #[serde(default)]
    pub exec_evenly_min_delay_ms: u64,
    #[serde(default)]
    pub block_duration: u64,
    pub key_prefix: String,
}

impl From<&LimiterOptions> for InitOptions {
    fn from(options: &LimiterOptions) -> Self {
        Self {
            points: options.points,
            duration: options.duration,
            exec_evenly: options.exec_evenly,
            exec_evenly_min_delay_ms: options.exec_evenly_min_delay_ms,
            block_duration: options.block_duration,
            key_prefix: options.key_prefix.clone(),
        }
    }
}

impl From<InitOptions> for LimiterOptions {
    fn from(opts: InitOptions) -> Self {
        Self {
            points: opts.points,
            duration: opts.duration,
            block_duration: opts.block_duration,
            exec_evenly: opts.exec_evenly,
            exec_evenly_min_delay_ms: opts.exec_evenly_min_delay_ms,
            key_prefix: opts.key_prefix,
            ..LimiterOptions::default()
        }
    }
}

/// Limiter verbs that can be called through the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Consume,
    Penalty,
    Reward,
    Get,
    Set,
    Block,
    Delete,
}

impl Func {
    pub fn as_str(&self) -> &'static str {
        match self {
            Func::Consume => "consume",
            Func::Penalty => "penalty",
            Func::Reward => "reward",
            Func::Get => "get",
            Func::Set => "set",
            Func::Block => "block",
            Func::Delete => "delete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "consume" => Some(Func::Consume),
            "penalty" => Some(Func::Penalty),
            "reward" => Some(Func::Reward),
            "get" => Some(Func::Get),
            "set" => Some(Func::Set),
            "block" => Some(Func::Block),
            "delete" => Some(Func::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub key: String,
    #[serde(default)]
    pub points_to_consume: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sec_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "CallOptions::is_empty")]
    pub options: CallOptions,
}

impl CallData {
    pub fn new(key: &str, points: i64, options: &CallOptions) -> Self {
        Self {
            key: key.to_string(),
            points_to_consume: points,
            sec_duration: None,
            options: options.clone(),
        }
    }

    pub fn with_sec_duration(mut self, sec_duration: u64) -> Self {
        self.sec_duration = Some(sec_duration);
        self
    }
}

/// Payload of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyData {
    Res(RateLimiterRes),
    Deleted { deleted: bool },
}

/// Whether a call resolved or was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Resolve,
    Reject,
}

/// The outcome of a call as sent back to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub data: Option<ReplyData>,
    pub error: Option<String>,
}

impl Reply {
    pub fn resolve(data: Option<ReplyData>) -> Self {
        Self {
            kind: ReplyKind::Resolve,
            data,
            error: None,
        }
    }

    pub fn reject(data: Option<ReplyData>) -> Self {
        Self {
            kind: ReplyKind::Reject,
            data,
            error: None,
        }
    }

    /// A rejection caused by a coordinator-side failure rather than a denial.
    pub fn failed(error: String) -> Self {
        Self {
            kind: ReplyKind::Reject,
            data: None,
            error: Some(error),
        }
    }
}

/// Typed cluster message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    /// Worker announces a limiter.
    Init(InitOptions),
    /// Coordinator has a limiter for the prefix.
    InitAck { key_prefix: String },
    /// Worker calls a verb.
    Call {
        key_prefix: String,
        id: String,
        func: Func,
        data: CallData,
    },
    /// Coordinator answers a call.
    Reply {
        key_prefix: String,
        id: String,
        reply: Reply,
    },
}

impl ClusterMessage {
    /// Encode for `channel`.
    pub fn into_packet(self, channel: &str) -> Packet {
        let mut packet = Packet {
            channel: channel.to_string(),
            ..Packet::default()
        };
        match self {
            ClusterMessage::Init(opts) => {
                packet.kind = Some(INIT.to_string());
                packet.opts = Some(opts);
            }
            ClusterMessage::InitAck { key_prefix } => {
                packet.kind = Some(INIT.to_string());
                packet.key_prefix = Some(key_prefix);
            }
            ClusterMessage::Call {
                key_prefix,
                id,
                func,
                data,
            } => {
                packet.key_prefix = Some(key_prefix);
                packet.id = Some(id);
                packet.func = Some(func.as_str().to_string());
                packet.data = serde_json::to_value(data).ok();
            }
            ClusterMessage::Reply { key_prefix, id, reply } => {
                let kind = match reply.kind {
                    ReplyKind::Resolve => RESOLVE,
                    ReplyKind::Reject => REJECT,
                };
                packet.kind = Some(kind.to_string());
                packet.key_prefix = Some(key_prefix);
                packet.id = Some(id);
                packet.data = reply.data.and_then(|data| serde_json::to_value(data).ok());
                packet.error = reply.error;
            }
        }
        packet
    }
}

impl Packet {
    /// Decode into a typed message.
    pub fn decode(self) -> Result<ClusterMessage, ClusterError> {
        match (self.kind, self.func) {
            (Some(kind), None) if kind == INIT => match (self.opts, self.key_prefix) {
                (Some(opts), _) => Ok(ClusterMessage::Init(opts)),
                (None, Some(key_prefix)) => Ok(ClusterMessage::InitAck { key_prefix }),
                (None, None) => Err(ClusterError::Protocol(
                    "init message without opts or keyPrefix".to_string(),
                )),
            },
            (Some(kind), None) => {
                let kind = match kind.as_str() {
                    RESOLVE => ReplyKind::Resolve,
                    REJECT => ReplyKind::Reject,
                    _ => {
                        return Err(ClusterError::UnknownMessageType {
                            key_prefix: self.key_prefix,
                            id: self.id,
                            kind,
                        })
                    }
                };
                let key_prefix = required(self.key_prefix, "keyPrefix")?;
                let id = required(self.id, "id")?;
                let data = match self.data {
                    Some(value) => Some(
                        serde_json::from_value(value)
                            .map_err(|e| ClusterError::Protocol(format!("invalid reply data: {}", e)))?,
                    ),
                    None => None,
                };
                Ok(ClusterMessage::Reply {
                    key_prefix,
                    id,
                    reply: Reply {
                        kind,
                        data,
                        error: self.error,
                    },
                })
            }
            (None, Some(func)) => {
                let func = Func::parse(&func)
                    .ok_or_else(|| ClusterError::Protocol(format!("unknown func {:?}", func)))?;
                let key_prefix = required(self.key_prefix, "keyPrefix")?;
                let id = required(self.id, "id")?;
                let data = required(self.data, "data")?;
                let data = serde_json::from_value(data)
                    .map_err(|e| ClusterError::Protocol(format!("invalid call data: {}", e)))?;
                Ok(ClusterMessage::Call {
                    key_prefix,
                    id,
                    func,
                    data,
                })
            }
            (Some(kind), Some(func)) => Err(ClusterError::Protocol(format!(
                "message has both type {:?} and func {:?}",
                kind, func
            ))),
            (None, None) => Err(ClusterError::Protocol(
                "message has neither type nor func".to_string(),
            )),
        }
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ClusterError> {
    value.ok_or_else(|| ClusterError::Protocol(format!("missing {}", field)))
}
