//! Messages exchanged with the app server.
//!
//! Server → client traffic is a stream of [`ForwardMsg`] frames; client →
//! server traffic is [`BackMsg`]. Both travel as binary websocket frames using
//! the JSON encoding in [`codec`].

pub mod codec;

use scene_tree::Delta;
use serde::{Deserialize, Serialize};

pub use codec::{ProtocolError, decode_back_msg, decode_forward_msg, encode_back_msg, encode_forward_msg};

/// Per-delivery metadata. Cached payloads are shared between deliveries but
/// each delivery keeps its own metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub delta_path: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    /// Content hash assigned by the server.
    pub hash: String,
    #[serde(default)]
    pub metadata: ForwardMsgMetadata,
    pub body: ForwardMsgBody,
}

impl ForwardMsg {
    pub fn new(hash: impl Into<String>, body: ForwardMsgBody) -> Self {
        Self {
            hash: hash.into(),
            metadata: ForwardMsgMetadata::default(),
            body,
        }
    }

    pub fn with_metadata(mut self, metadata: ForwardMsgMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hash of the cached payload this message stands in for, if it is a
    /// reference message.
    pub fn ref_hash(&self) -> Option<&str> {
        match &self.body {
            ForwardMsgBody::RefHash(hash) => Some(hash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMsgBody {
    NewSession(NewSession),
    SessionStatusChanged(SessionStatus),
    ScriptFinished(ScriptFinishedStatus),
    Delta(Delta),
    RefHash(String),
    PageInfoChanged(PageInfo),
}

impl ForwardMsgBody {
    pub fn label(&self) -> &'static str {
        match self {
            ForwardMsgBody::NewSession(_) => "new_session",
            ForwardMsgBody::SessionStatusChanged(_) => "session_status_changed",
            ForwardMsgBody::ScriptFinished(_) => "script_finished",
            ForwardMsgBody::Delta(_) => "delta",
            ForwardMsgBody::RefHash(_) => "ref_hash",
            ForwardMsgBody::PageInfoChanged(_) => "page_info_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub script_run_id: String,
    pub session_id: String,
    #[serde(default)]
    pub config: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Runs a cached message may go unreferenced before eviction.
    #[serde(default = "default_max_cached_message_age")]
    pub max_cached_message_age: u64,
}

fn default_max_cached_message_age() -> u64 {
    2
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_cached_message_age: default_max_cached_message_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(default)]
    pub script_is_running: bool,
    #[serde(default)]
    pub run_on_save: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub query_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackMsg {
    RerunScript(RerunRequest),
    StopScript,
    ClearCache,
    AppHeartbeat,
}

impl BackMsg {
    pub fn label(&self) -> &'static str {
        match self {
            BackMsg::RerunScript(_) => "rerun_script",
            BackMsg::StopScript => "stop_script",
            BackMsg::ClearCache => "clear_cache",
            BackMsg::AppHeartbeat => "app_heartbeat",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunRequest {
    #[serde(default)]
    pub query_string: String,
}
