//! Wire messages and framing.
//!
//! Frames are length-prefixed JSON documents carrying one tagged [`Message`]
//! each. Request/answer pairs are correlated by a 64-bit identifier
//! allocated by the sending connection; one-way frames (ping, log, abort,
//! terminate) carry no identifier of their own.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::expr::Expr;
use crate::value::Value;

/// Outcome states of a constraint request.
///
/// `Success`, `Failure` and `Interrupted` are terminal and user-visible.
/// `TempFail` and `RunAgain` are the internal pause/resume protocol: they
/// travel between agents but never close a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintState {
    Success,
    Failure,
    Interrupted,
    TempFail,
    RunAgain,
}

impl ConstraintState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConstraintState::Success | ConstraintState::Failure | ConstraintState::Interrupted
        )
    }
}

/// Every frame kind exchanged in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    RequestName {
        id: u64,
        name: String,
    },
    RequestNameAnswer {
        id: u64,
        name: String,
        success: bool,
        endpoints: Vec<SocketAddr>,
    },
    RegisterName {
        id: u64,
        name: String,
        endpoints: Vec<SocketAddr>,
    },
    RegisterNameAnswer {
        id: u64,
        name: String,
        success: bool,
        assigned: Option<SocketAddr>,
    },
    RequestVariableValue {
        id: u64,
        src: String,
        var: String,
    },
    VariableValue {
        id: u64,
        var: String,
        /// `None` when the variable is unknown to the owning agent.
        value: Option<Value>,
    },
    RequestConstraint {
        id: u64,
        src: String,
        constraint: Expr,
        repeat: bool,
        unify: Vec<(Expr, Expr)>,
    },
    RequestConstraintAck {
        id: u64,
    },
    RequestConstraintAnswer {
        id: u64,
        state: ConstraintState,
        payload: Option<String>,
    },
    /// Requests interruption of the in-flight request `id`; the answer
    /// arrives as an `Interrupted` state on the original request.
    Abort {
        src: String,
        id: u64,
    },
    /// Liveness beacon; never answered.
    Ping {
        name: String,
    },
    LogMsg {
        date: DateTime<Utc>,
        src: String,
        msg: String,
    },
    InformDeathAgent {
        name: String,
    },
    /// Unilateral channel close with a reason.
    Terminate {
        msg: String,
    },
}

impl Message {
    /// Identifier this frame answers, when it is an answer.
    pub fn answer_id(&self) -> Option<u64> {
        match self {
            Message::RequestNameAnswer { id, .. }
            | Message::RegisterNameAnswer { id, .. }
            | Message::VariableValue { id, .. }
            | Message::RequestConstraintAck { id }
            | Message::RequestConstraintAnswer { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestName { .. } => "request_name",
            Message::RequestNameAnswer { .. } => "request_name_answer",
            Message::RegisterName { .. } => "register_name",
            Message::RegisterNameAnswer { .. } => "register_name_answer",
            Message::RequestVariableValue { .. } => "request_variable_value",
            Message::VariableValue { .. } => "variable_value",
            Message::RequestConstraint { .. } => "request_constraint",
            Message::RequestConstraintAck { .. } => "request_constraint_ack",
            Message::RequestConstraintAnswer { .. } => "request_constraint_answer",
            Message::Abort { .. } => "abort",
            Message::Ping { .. } => "ping",
            Message::LogMsg { .. } => "log_msg",
            Message::InformDeathAgent { .. } => "inform_death_agent",
            Message::Terminate { .. } => "terminate",
        }
    }
}

/// Length-prefixed JSON codec for [`Message`] frames.
pub struct WireCodec {
    inner: LengthDelimitedCodec,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Message> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&msg).map_err(io::Error::other)?;
        self.inner.encode(Bytes::from(payload), dst)
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            None => Ok(None),
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}
