//! Request and reply frame types.
//!
//! Mirrors the nine-part client message / five-part server message layout
//! from `protocols/zmq/message.py`'s `CM_INDEX_*`/`SM_INDEX_*` constants.
//! Each frame is carried on the wire as an ordered list of byte strings; see
//! [`crate::endpoint`] for how that list is framed over a byte-stream
//! transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecRegistry, TypedPayload};
use crate::error::BrokerError;

/// Number of parts in a request frame.
pub const REQUEST_PART_COUNT: usize = 9;
/// Number of parts in a reply frame.
pub const REPLY_PART_COUNT: usize = 5;

/// Request message type, part index 1 of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Liveness/connect check. Bypasses the per-Thing queue.
    Handshake,
    /// A property/action operation to route to a Thing.
    Operation,
    /// Stop the broker or a component of it. Bypasses the per-Thing queue.
    Exit,
    /// Interrupt a peer parked in a receive call.
    Interrupt,
}

impl MsgType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MsgType::Handshake => b"HANDSHAKE",
            MsgType::Operation => b"OPERATION",
            MsgType::Exit => b"EXIT",
            MsgType::Interrupt => b"INTERRUPT",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        match bytes {
            b"HANDSHAKE" => Ok(MsgType::Handshake),
            b"OPERATION" => Ok(MsgType::Operation),
            b"EXIT" => Ok(MsgType::Exit),
            b"INTERRUPT" => Ok(MsgType::Interrupt),
            other => Err(BrokerError::Malformed(format!(
                "unknown request message type: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Reply message type, part index 1 of a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Successful operation result.
    Reply,
    /// Response to a HANDSHAKE request.
    Handshake,
    /// Invocation or execution deadline elapsed.
    Timeout,
    /// The operation raised an error.
    Exception,
    /// The request frame itself could not be parsed or routed.
    InvalidMessage,
}

impl ReplyKind {
    /// Wire byte-string for this reply kind.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ReplyKind::Reply => b"REPLY",
            ReplyKind::Handshake => b"HANDSHAKE",
            ReplyKind::Timeout => b"TIMEOUT",
            ReplyKind::Exception => b"EXCEPTION",
            ReplyKind::InvalidMessage => b"INVALID_MESSAGE",
        }
    }
}

/// Operation requested on a Thing's property or action, part index 6 of a
/// request frame.
///
/// Parsing a frame never fails on an unrecognized operation token: the
/// Listener only classifies `msg-type` (part index 1), not `operation`, so
/// an unknown token is carried as [`Operation::Unknown`] and rejected later
/// by the Executor's dispatch, which is where the result-envelope table
/// places that rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Read a single property.
    ReadProperty,
    /// Write a single property.
    WriteProperty,
    /// Delete a single property, if the property supports it.
    DeleteProperty,
    /// Invoke an action.
    InvokeAction,
    /// Read a named subset of properties.
    ReadMultipleProperties,
    /// Read every property.
    ReadAllProperties,
    /// Write a named subset of properties.
    WriteMultipleProperties,
    /// Write every property supplied in the payload.
    WriteAllProperties,
    /// An operation token outside the eight recognized ones.
    Unknown(String),
}

impl Operation {
    fn as_bytes(&self) -> Vec<u8> {
        match self {
            Operation::ReadProperty => b"readProperty".to_vec(),
            Operation::WriteProperty => b"writeProperty".to_vec(),
            Operation::DeleteProperty => b"deleteProperty".to_vec(),
            Operation::InvokeAction => b"invokeAction".to_vec(),
            Operation::ReadMultipleProperties => b"readMultipleProperties".to_vec(),
            Operation::ReadAllProperties => b"readAllProperties".to_vec(),
            Operation::WriteMultipleProperties => b"writeMultipleProperties".to_vec(),
            Operation::WriteAllProperties => b"writeAllProperties".to_vec(),
            Operation::Unknown(token) => token.clone().into_bytes(),
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"readProperty" => Operation::ReadProperty,
            b"writeProperty" => Operation::WriteProperty,
            b"deleteProperty" => Operation::DeleteProperty,
            b"invokeAction" => Operation::InvokeAction,
            b"readMultipleProperties" => Operation::ReadMultipleProperties,
            b"readAllProperties" => Operation::ReadAllProperties,
            b"writeMultipleProperties" => Operation::WriteMultipleProperties,
            b"writeAllProperties" => Operation::WriteAllProperties,
            other => Operation::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

fn default_timeout_secs() -> Option<f64> {
    Some(5.0)
}

/// Server-level execution context, part index 3 of a request frame.
///
/// A field absent from the wire JSON falls back to its default; a field
/// present but explicitly `null` means "no timeout", which is why the
/// timeout fields are `Option<f64>` rather than plain `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerExecContext {
    /// Seconds to wait between receipt and dispatch to the Executor.
    /// `None` disables the invocation timeout.
    #[serde(default = "default_timeout_secs")]
    pub invocation_timeout: Option<f64>,
    /// Seconds to wait between dispatch and reply from the Executor.
    /// `None` disables the execution timeout.
    #[serde(default = "default_timeout_secs")]
    pub execution_timeout: Option<f64>,
    /// When true, the Dispatcher drops the reply instead of forwarding it.
    #[serde(default)]
    pub oneway: bool,
}

impl Default for ServerExecContext {
    fn default() -> Self {
        Self {
            invocation_timeout: default_timeout_secs(),
            execution_timeout: default_timeout_secs(),
            oneway: false,
        }
    }
}

/// Thing-level execution context, part index 8 of a request frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThingExecContext {
    /// Capture log records emitted during execution and return them
    /// alongside the result.
    #[serde(default)]
    pub fetch_execution_logs: bool,
}

/// A fully parsed request frame.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    /// Address of the endpoint the reply must be routed back to.
    pub sender_addr: Bytes,
    /// Request message type.
    pub msg_type: MsgType,
    /// Hex-encoded 128-bit message identifier.
    pub msg_id: String,
    /// Server-level execution context.
    pub server_exec_ctx: ServerExecContext,
    /// Target Thing identifier.
    pub thing_id: Bytes,
    /// Target property/action name within the Thing.
    pub object_name: Bytes,
    /// Requested operation. Only meaningful for `MsgType::Operation`.
    pub operation: Option<Operation>,
    /// Request payload, present only for `MsgType::Operation`.
    pub payload: Option<TypedPayload>,
    /// Thing-level execution context.
    pub thing_exec_ctx: ThingExecContext,
}

/// Generate a new message id: 128 bits of randomness, hex encoded.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn encode_payload_part(payload: &TypedPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.content_type.len() + payload.bytes.len());
    out.push(payload.content_type.len() as u8);
    out.extend_from_slice(payload.content_type.as_bytes());
    out.extend_from_slice(&payload.bytes);
    out
}

fn decode_payload_part(bytes: &[u8]) -> Result<TypedPayload, BrokerError> {
    let len = *bytes
        .first()
        .ok_or_else(|| BrokerError::Malformed("empty payload part".into()))? as usize;
    if bytes.len() < 1 + len {
        return Err(BrokerError::Malformed("payload content-type header truncated".into()));
    }
    let content_type = std::str::from_utf8(&bytes[1..1 + len])
        .map_err(|e| BrokerError::Malformed(format!("payload content-type not utf8: {e}")))?
        .to_string();
    Ok(TypedPayload::new(content_type, bytes[1 + len..].to_vec()))
}

impl RequestFrame {
    /// Build a HANDSHAKE or EXIT request addressed to `thing_id` (empty for
    /// broker-wide EXIT).
    pub fn plain(sender_addr: Bytes, msg_type: MsgType) -> Self {
        Self {
            sender_addr,
            msg_type,
            msg_id: new_message_id(),
            server_exec_ctx: ServerExecContext::default(),
            thing_id: Bytes::new(),
            object_name: Bytes::new(),
            operation: None,
            payload: None,
            thing_exec_ctx: ThingExecContext::default(),
        }
    }

    /// Build an OPERATION request frame.
    #[allow(clippy::too_many_arguments)]
    pub fn operation(
        sender_addr: Bytes,
        thing_id: Bytes,
        object_name: Bytes,
        operation: Operation,
        payload: TypedPayload,
        server_exec_ctx: ServerExecContext,
        thing_exec_ctx: ThingExecContext,
    ) -> Self {
        Self {
            sender_addr,
            msg_type: MsgType::Operation,
            msg_id: new_message_id(),
            server_exec_ctx,
            thing_id,
            object_name,
            operation: Some(operation),
            payload: Some(payload),
            thing_exec_ctx,
        }
    }

    /// Decode a request frame from its nine wire parts.
    pub fn from_parts(parts: &[Bytes]) -> Result<Self, BrokerError> {
        if parts.len() != REQUEST_PART_COUNT {
            return Err(BrokerError::Malformed(format!(
                "expected {REQUEST_PART_COUNT} request parts, got {}",
                parts.len()
            )));
        }
        let msg_type = MsgType::from_bytes(&parts[1])?;
        let msg_id = String::from_utf8(parts[2].to_vec())
            .map_err(|e| BrokerError::Malformed(format!("message id not utf8: {e}")))?;
        let server_exec_ctx: ServerExecContext = if parts[3].is_empty() {
            ServerExecContext::default()
        } else {
            serde_json::from_slice(&parts[3])
                .map_err(|e| BrokerError::Malformed(format!("server exec context: {e}")))?
        };
        let thing_exec_ctx: ThingExecContext = if parts[8].is_empty() {
            ThingExecContext::default()
        } else {
            serde_json::from_slice(&parts[8])
                .map_err(|e| BrokerError::Malformed(format!("thing exec context: {e}")))?
        };
        let (operation, payload) = if msg_type == MsgType::Operation {
            (
                Some(Operation::from_bytes(&parts[6])),
                Some(decode_payload_part(&parts[7])?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            sender_addr: parts[0].clone(),
            msg_type,
            msg_id,
            server_exec_ctx,
            thing_id: parts[4].clone(),
            object_name: parts[5].clone(),
            operation,
            payload,
            thing_exec_ctx,
        })
    }

    /// Encode this frame into its nine wire parts.
    pub fn to_parts(&self) -> Vec<Bytes> {
        let server_exec_ctx = serde_json::to_vec(&self.server_exec_ctx).unwrap_or_default();
        let thing_exec_ctx = serde_json::to_vec(&self.thing_exec_ctx).unwrap_or_default();
        let operation = self.operation.as_ref().map(Operation::as_bytes).unwrap_or_default();
        let payload = self
            .payload
            .as_ref()
            .map(encode_payload_part)
            .unwrap_or_default();
        vec![
            self.sender_addr.clone(),
            Bytes::from_static(self.msg_type.as_bytes()),
            Bytes::from(self.msg_id.clone()),
            Bytes::from(server_exec_ctx),
            self.thing_id.clone(),
            self.object_name.clone(),
            Bytes::from(operation),
            Bytes::from(payload),
            Bytes::from(thing_exec_ctx),
        ]
    }
}

/// A fully parsed reply frame.
#[derive(Debug, Clone)]
pub struct ReplyFrame {
    /// Address of the endpoint this reply is routed to.
    pub receiver_addr: Bytes,
    /// Reply message type.
    pub msg_type: ReplyKind,
    /// Message id mirroring the originating request.
    pub msg_id: String,
    /// Typed reply data, decoded via [`CodecRegistry`].
    pub data: Option<TypedPayload>,
    /// Raw bytes attached by the executor, forwarded opaquely.
    pub pre_encoded_data: Bytes,
}

impl ReplyFrame {
    /// Build a reply frame in response to `request`.
    pub fn for_request(
        request: &RequestFrame,
        msg_type: ReplyKind,
        data: Option<TypedPayload>,
    ) -> Self {
        Self {
            receiver_addr: request.sender_addr.clone(),
            msg_type,
            msg_id: request.msg_id.clone(),
            data,
            pre_encoded_data: Bytes::new(),
        }
    }

    /// Decode a reply frame from its five wire parts.
    pub fn from_parts(parts: &[Bytes]) -> Result<Self, BrokerError> {
        if parts.len() != REPLY_PART_COUNT {
            return Err(BrokerError::Malformed(format!(
                "expected {REPLY_PART_COUNT} reply parts, got {}",
                parts.len()
            )));
        }
        let msg_type = match parts[1].as_ref() {
            b"REPLY" => ReplyKind::Reply,
            b"HANDSHAKE" => ReplyKind::Handshake,
            b"TIMEOUT" => ReplyKind::Timeout,
            b"EXCEPTION" => ReplyKind::Exception,
            b"INVALID_MESSAGE" => ReplyKind::InvalidMessage,
            other => {
                return Err(BrokerError::Malformed(format!(
                    "unknown reply message type: {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        let msg_id = String::from_utf8(parts[2].to_vec())
            .map_err(|e| BrokerError::Malformed(format!("message id not utf8: {e}")))?;
        let data = if parts[3].is_empty() {
            None
        } else {
            Some(decode_payload_part(&parts[3])?)
        };
        Ok(Self {
            receiver_addr: parts[0].clone(),
            msg_type,
            msg_id,
            data,
            pre_encoded_data: parts[4].clone(),
        })
    }

    /// Encode this frame into its five wire parts.
    pub fn to_parts(&self) -> Vec<Bytes> {
        let data = self.data.as_ref().map(encode_payload_part).unwrap_or_default();
        vec![
            self.receiver_addr.clone(),
            Bytes::from_static(self.msg_type.as_bytes()),
            Bytes::from(self.msg_id.clone()),
            Bytes::from(data),
            self.pre_encoded_data.clone(),
        ]
    }

    /// Decode [`Self::data`] through a codec registry into a
    /// `serde_json::Value`, if present.
    pub fn decode_data(&self, codecs: &CodecRegistry) -> Result<Option<serde_json::Value>, BrokerError> {
        self.data.as_ref().map(|p| codecs.decode(p)).transpose()
    }
}
