//! Per-endpoint receive loop.
//!
//! One Listener per inbound endpoint binding. Classifies each frame by
//! message type: HANDSHAKE and EXIT are answered/acted on immediately,
//! bypassing the per-Thing queue; OPERATION is resolved to a
//! [`crate::dispatcher::Dispatcher`] and enqueued; anything else, or
//! anything that fails to parse, becomes an `INVALID_MESSAGE` reply sent
//! straight back to the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::codec::TypedPayload;
use crate::dispatcher::{Dispatcher, QueuedRequest, SharedEndpoint};
use crate::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::frame::{MsgType, ReplyFrame, ReplyKind, RequestFrame};

/// Thing-id-keyed lookup of running dispatchers, shared by every Listener.
///
/// A `RwLock` rather than a plain map: `Broker::attach` can register a new
/// Thing while listeners are already running, per the broker's
/// `Running`-only attach rule.
#[derive(Default)]
pub struct ThingRegistry {
    dispatchers: RwLock<HashMap<String, Dispatcher>>,
}

impl ThingRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the dispatcher for a Thing id.
    pub fn insert(&self, thing_id: String, dispatcher: Dispatcher) {
        self.dispatchers
            .write()
            .expect("thing registry lock poisoned")
            .insert(thing_id, dispatcher);
    }

    /// Look up a dispatcher handle by Thing id. Returns an owned clone since
    /// `Dispatcher` is cheap to clone and the lock must not be held across
    /// an `await`.
    pub fn get(&self, thing_id: &str) -> Option<Dispatcher> {
        self.dispatchers
            .read()
            .expect("thing registry lock poisoned")
            .get(thing_id)
            .cloned()
    }

    /// Drop every registered dispatcher. Each `Dispatcher` holds the only
    /// long-lived clone of its Thing's inbox sender, so clearing the
    /// registry drops that sender and lets the Thing's dispatch loop observe
    /// a closed inbox and exit, which in turn closes the executor endpoint
    /// and ends the Executor. Called by the broker supervisor during
    /// shutdown, once no further `attach` can race with it.
    pub fn clear(&self) {
        self.dispatchers.write().expect("thing registry lock poisoned").clear();
    }
}

/// Runs the receive loop for one endpoint until EXIT or a transport error.
pub struct Listener {
    endpoint: SharedEndpoint,
    things: Arc<ThingRegistry>,
    stop: Arc<AtomicBool>,
}

impl Listener {
    /// Build a listener over `endpoint`, routing OPERATION requests through
    /// `things`. `stop` is checked between reads and set on EXIT, so the
    /// broker supervisor can observe shutdown across every Listener.
    pub fn new(endpoint: Box<dyn Endpoint>, things: Arc<ThingRegistry>, stop: Arc<AtomicBool>) -> Self {
        Self {
            endpoint: Arc::new(Mutex::new(SendableEndpoint(endpoint))),
            things,
            stop,
        }
    }

    /// A clone of this listener's shared endpoint handle, so an owner (the
    /// broker supervisor) can force-close the connection from outside the
    /// receive loop to unblock a parked `recv_multipart`.
    pub fn endpoint_handle(&self) -> SharedEndpoint {
        self.endpoint.clone()
    }

    /// Run the receive loop. Returns when EXIT is received, the transport
    /// errors, or `stop` is observed set by another component.
    pub async fn run(self) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                log::info!("listener stopping: stop flag observed");
                break;
            }

            let parts = {
                let mut endpoint = self.endpoint.lock().await;
                endpoint.recv_multipart().await
            };
            let parts = match parts {
                Ok(parts) => parts,
                Err(e) => {
                    log::info!("listener stopping: {e}");
                    break;
                }
            };

            let request = match RequestFrame::from_parts(&parts) {
                Ok(request) => request,
                Err(e) => {
                    self.reply_invalid(&parts, &e).await;
                    continue;
                }
            };

            match request.msg_type {
                MsgType::Handshake => self.handle_handshake(&request).await,
                MsgType::Exit => {
                    log::info!("listener received EXIT");
                    self.stop.store(true, Ordering::Release);
                    break;
                }
                MsgType::Operation => self.handle_operation(request).await,
                MsgType::Interrupt => {
                    self.reply_invalid_for(&request, &BrokerError::Malformed("INTERRUPT not routable here".into()))
                        .await;
                }
            }
        }
    }

    async fn handle_handshake(&self, request: &RequestFrame) {
        let reply = ReplyFrame::for_request(request, ReplyKind::Handshake, None);
        let mut endpoint = self.endpoint.lock().await;
        if let Err(e) = endpoint.send_multipart(reply.to_parts()).await {
            log::warn!("failed to send handshake reply: {e}");
        }
    }

    async fn handle_operation(&self, request: RequestFrame) {
        let thing_id = match std::str::from_utf8(&request.thing_id) {
            Ok(id) => id.to_string(),
            Err(_) => {
                self.reply_invalid_for(&request, &BrokerError::Malformed("thing id not utf8".into()))
                    .await;
                return;
            }
        };
        let Some(dispatcher) = self.things.get(&thing_id) else {
            self.reply_invalid_for(&request, &BrokerError::UnknownTarget(format!("no such thing: {thing_id}")))
                .await;
            return;
        };
        log::debug!(
            "client '{}' queuing message '{}' for thing '{thing_id}'",
            String::from_utf8_lossy(&request.sender_addr),
            request.msg_id,
        );
        if dispatcher.enqueue(QueuedRequest::new(request, self.endpoint.clone())).is_err() {
            log::warn!("dispatcher for thing '{thing_id}' is no longer accepting requests");
        }
    }

    async fn reply_invalid_for(&self, request: &RequestFrame, error: &BrokerError) {
        let payload = TypedPayload::new("text/plain", error.to_string().into_bytes());
        let reply = ReplyFrame::for_request(request, ReplyKind::InvalidMessage, Some(payload));
        let mut endpoint = self.endpoint.lock().await;
        if let Err(e) = endpoint.send_multipart(reply.to_parts()).await {
            log::warn!("failed to send invalid-message reply: {e}");
        }
    }

    /// Best-effort INVALID_MESSAGE reply when the frame couldn't even be
    /// parsed into a [`RequestFrame`]: address and message id are read
    /// directly off the raw parts when present.
    async fn reply_invalid(&self, parts: &[Bytes], error: &BrokerError) {
        let receiver_addr = parts.first().cloned().unwrap_or_default();
        let msg_id = parts
            .get(2)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default();
        let reply = ReplyFrame {
            receiver_addr,
            msg_type: ReplyKind::InvalidMessage,
            msg_id,
            data: Some(TypedPayload::new("text/plain", error.to_string().into_bytes())),
            pre_encoded_data: Bytes::new(),
        };
        log::error!("received malformed message: {error}");
        let mut endpoint = self.endpoint.lock().await;
        if let Err(e) = endpoint.send_multipart(reply.to_parts()).await {
            log::warn!("failed to send invalid-message reply: {e}");
        }
    }
}

/// Adapts a boxed `dyn Endpoint` so it can live behind the
/// `SharedEndpoint` alias `Arc<Mutex<dyn Endpoint>>` used by
/// [`crate::dispatcher`] without duplicating that type.
struct SendableEndpoint(Box<dyn Endpoint>);

#[async_trait::async_trait]
impl Endpoint for SendableEndpoint {
    async fn send_multipart(&mut self, parts: Vec<Bytes>) -> Result<(), BrokerError> {
        self.0.send_multipart(parts).await
    }

    async fn recv_multipart(&mut self) -> Result<Vec<Bytes>, BrokerError> {
        self.0.recv_multipart().await
    }

    fn close(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::endpoint::InprocEndpoint;
    use crate::frame::{Operation, ServerExecContext, ThingExecContext};
    use crate::thing::{ActionRegistry, PropertyRegistry, Thing};
    use std::time::Duration;

    struct EmptyThing(String, PropertyRegistry, ActionRegistry);
    impl Thing for EmptyThing {
        fn id(&self) -> &str {
            &self.0
        }
        fn properties(&self) -> &PropertyRegistry {
            &self.1
        }
        fn actions(&self) -> &ActionRegistry {
            &self.2
        }
    }

    fn registry_with_thing(id: &str) -> Arc<ThingRegistry> {
        let thing: Arc<dyn Thing> = Arc::new(EmptyThing(id.to_string(), PropertyRegistry::new(), ActionRegistry::new()));
        let (dispatcher, _handle) = Dispatcher::spawn(thing, Arc::new(CodecRegistry::new()));
        let registry = ThingRegistry::new();
        registry.insert(id.to_string(), dispatcher);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn handshake_gets_immediate_reply() {
        let (client_side, listener_side) = InprocEndpoint::pair();
        let things = registry_with_thing("thing-0");
        let stop = Arc::new(AtomicBool::new(false));
        let listener = Listener::new(Box::new(listener_side), things, stop.clone());
        tokio::spawn(listener.run());

        let mut client_side = client_side;
        let handshake = RequestFrame::plain(Bytes::from_static(b"client-1"), MsgType::Handshake);
        client_side.send_multipart(handshake.to_parts()).await.unwrap();
        let reply_parts = tokio::time::timeout(Duration::from_secs(2), client_side.recv_multipart())
            .await
            .unwrap()
            .unwrap();
        let reply = ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Handshake);

        stop.store(true, Ordering::Release);
    }

    #[tokio::test]
    async fn exit_stops_the_listener() {
        let (mut client_side, listener_side) = InprocEndpoint::pair();
        let things = registry_with_thing("thing-0");
        let stop = Arc::new(AtomicBool::new(false));
        let listener = Listener::new(Box::new(listener_side), things, stop.clone());
        let handle = tokio::spawn(listener.run());

        let exit = RequestFrame::plain(Bytes::from_static(b"client-1"), MsgType::Exit);
        client_side.send_multipart(exit.to_parts()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(stop.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn unknown_thing_id_gets_invalid_message() {
        let (mut client_side, listener_side) = InprocEndpoint::pair();
        let things = registry_with_thing("thing-0");
        let stop = Arc::new(AtomicBool::new(false));
        let listener = Listener::new(Box::new(listener_side), things, stop.clone());
        tokio::spawn(listener.run());

        let codecs = CodecRegistry::new();
        let payload = codecs.encode("application/json", &serde_json::json!(null)).unwrap();
        let request = RequestFrame::operation(
            Bytes::from_static(b"client-1"),
            Bytes::from_static(b"ghost-thing"),
            Bytes::from_static(b"prop"),
            Operation::ReadProperty,
            payload,
            ServerExecContext::default(),
            ThingExecContext::default(),
        );
        client_side.send_multipart(request.to_parts()).await.unwrap();
        let reply_parts = tokio::time::timeout(Duration::from_secs(2), client_side.recv_multipart())
            .await
            .unwrap()
            .unwrap();
        let reply = ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::InvalidMessage);

        stop.store(true, Ordering::Release);
    }
}
