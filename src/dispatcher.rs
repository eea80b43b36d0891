//! Per-Thing request queue and timeout supervision.
//!
//! One Dispatcher owns exactly one Thing's inbox and the Dispatcher-side
//! half of the inproc channel paired with that Thing's
//! [`crate::executor::Executor`]. It is the Rust rendering of
//! `tunnel_message_to_things`/`process_timeouts` in the original source:
//! a "timer wait(gate, deadline)" becomes a `tokio::sync::oneshot` gate
//! raced against `tokio::time::sleep_until` via `tokio::select!`, and the
//! Dispatcher is the only writer of TIMEOUT replies.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::TypedPayload;
use crate::endpoint::{Endpoint, InprocEndpoint};
use crate::executor::Executor;
use crate::frame::{ReplyFrame, ReplyKind, RequestFrame};
use crate::thing::Thing;

/// A boxed, shareable endpoint multiple tasks may write a reply to: the
/// Dispatcher's normal reply path and a timeout supervisor's direct TIMEOUT
/// write both need access to the same origin connection.
pub type SharedEndpoint = Arc<Mutex<dyn Endpoint>>;

/// A request queued for a Thing's Dispatcher, paired with the endpoint its
/// reply (or timeout) must be written back to.
pub struct QueuedRequest {
    request: RequestFrame,
    origin: SharedEndpoint,
    invocation_gate: Option<oneshot::Sender<()>>,
    invocation_timeout_task: Option<JoinHandle<bool>>,
}

impl QueuedRequest {
    /// Enqueue `request`, starting its invocation timeout supervisor (if
    /// `server_exec_ctx.invocation_timeout` is set) clocked from now.
    pub fn new(request: RequestFrame, origin: SharedEndpoint) -> Self {
        let invocation_timeout = request.server_exec_ctx.invocation_timeout;
        let (invocation_gate, timeout_task) = match invocation_timeout {
            Some(secs) => {
                let (tx, rx) = oneshot::channel();
                let origin = origin.clone();
                let request_echo = request.clone();
                let handle = tokio::spawn(run_timeout_supervisor(rx, secs, origin, request_echo, "invocation"));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };
        Self {
            request,
            origin,
            invocation_gate,
            invocation_timeout_task: timeout_task,
        }
    }
}

/// Races a gate against a deadline; sends a TIMEOUT reply and returns
/// `true` if the deadline wins, returns `false` if the gate fires first.
///
/// `biased` ordering means an already-signaled gate always wins over an
/// expired deadline observed in the same poll, matching the resolved race
/// rule: the gate wins if it becomes visible before the deadline.
async fn run_timeout_supervisor(
    gate: oneshot::Receiver<()>,
    timeout_secs: f64,
    origin: SharedEndpoint,
    request: RequestFrame,
    kind: &'static str,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs.max(0.0));
    tokio::select! {
        biased;
        _ = gate => false,
        _ = tokio::time::sleep_until(deadline) => {
            log::warn!(
                "thing '{}' {kind} timeout after {timeout_secs}s for message '{}'",
                String::from_utf8_lossy(&request.thing_id),
                request.msg_id,
            );
            let reply = ReplyFrame::for_request(
                &request,
                ReplyKind::Timeout,
                Some(TypedPayload::new("text/plain", kind.as_bytes().to_vec())),
            );
            let mut origin = origin.lock().await;
            if let Err(e) = origin.send_multipart(reply.to_parts()).await {
                log::warn!("failed to deliver {kind} timeout reply: {e}");
            }
            true
        }
    }
}

/// Handle to a running per-Thing dispatcher. Cheaply cloneable: every clone
/// shares the same inbox, so the registry can hand out owned handles without
/// holding a lock across an `await`.
#[derive(Clone)]
pub struct Dispatcher {
    thing_id: String,
    inbox: mpsc::UnboundedSender<QueuedRequest>,
}

impl Dispatcher {
    /// Spawn a Dispatcher and its Executor for `thing`.
    ///
    /// Returns a handle whose [`Dispatcher::enqueue`] feeds the Listener's
    /// matched requests in, and the `JoinHandle` for the dispatch loop task
    /// (join it during shutdown to know the Thing has drained).
    pub fn spawn(thing: Arc<dyn Thing>, codecs: Arc<crate::codec::CodecRegistry>) -> (Self, JoinHandle<()>) {
        let thing_id = thing.id().to_string();
        let (dispatcher_side, executor_side) = InprocEndpoint::pair();
        let executor = Executor::new(thing, executor_side, codecs);
        tokio::spawn(executor.run());

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let loop_handle = tokio::spawn(run_dispatch_loop(thing_id.clone(), inbox_rx, dispatcher_side));

        (
            Self {
                thing_id,
                inbox: inbox_tx,
            },
            loop_handle,
        )
    }

    /// This dispatcher's Thing id.
    pub fn thing_id(&self) -> &str {
        &self.thing_id
    }

    /// Queue a request for processing. Fails only if the dispatch loop has
    /// already exited.
    pub fn enqueue(&self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        self.inbox.send(request).map_err(|e| e.0)
    }
}

async fn run_dispatch_loop(
    thing_id: String,
    mut inbox: mpsc::UnboundedReceiver<QueuedRequest>,
    mut executor_endpoint: InprocEndpoint,
) {
    while let Some(queued) = inbox.recv().await {
        let QueuedRequest {
            request,
            origin,
            invocation_gate,
            invocation_timeout_task,
        } = queued;

        if let Some(gate) = invocation_gate {
            let _ = gate.send(());
        }
        if let Some(task) = invocation_timeout_task {
            match task.await {
                Ok(true) => continue, // invocation timeout already replied
                Ok(false) => {}
                Err(e) => log::warn!("invocation timeout supervisor for thing '{thing_id}' panicked: {e}"),
            }
        }

        let execution_timeout = request.server_exec_ctx.execution_timeout;
        let oneway = request.server_exec_ctx.oneway;

        let (execution_gate, execution_timeout_task) = match execution_timeout {
            Some(secs) => {
                let (tx, rx) = oneshot::channel();
                let handle = tokio::spawn(run_timeout_supervisor(rx, secs, origin.clone(), request.clone(), "execution"));
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        if let Err(e) = executor_endpoint.send_multipart(request.to_parts()).await {
            log::error!("thing '{thing_id}' executor endpoint closed: {e}");
            break;
        }
        let reply_parts: Vec<Bytes> = match executor_endpoint.recv_multipart().await {
            Ok(parts) => parts,
            Err(e) => {
                log::error!("thing '{thing_id}' executor endpoint closed while awaiting reply: {e}");
                break;
            }
        };

        if let Some(gate) = execution_gate {
            let _ = gate.send(());
        }
        if let Some(task) = execution_timeout_task {
            match task.await {
                Ok(true) => continue, // execution timeout already replied
                Ok(false) => {}
                Err(e) => log::warn!("execution timeout supervisor for thing '{thing_id}' panicked: {e}"),
            }
        }

        if oneway {
            continue;
        }

        let mut origin = origin.lock().await;
        if let Err(e) = origin.send_multipart(reply_parts).await {
            log::warn!("thing '{thing_id}' failed to deliver reply: {e}");
        }
    }
    log::info!("dispatcher for thing '{thing_id}' stopped: inbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::endpoint::InprocEndpoint;
    use crate::frame::{Operation, ServerExecContext, ThingExecContext};
    use crate::thing::{Action, ActionArgs, ActionRegistry, PropertyRegistry};
    use std::time::Duration as StdDuration;

    struct NoopAction;
    impl Action for NoopAction {
        fn invoke(&self, _args: ActionArgs) -> Result<serde_json::Value, crate::error::BrokerError> {
            Ok(serde_json::Value::Bool(true))
        }
    }

    struct SlowAction;
    #[async_trait::async_trait]
    impl crate::thing::AsyncAction for SlowAction {
        async fn invoke(&self, _args: ActionArgs) -> Result<serde_json::Value, crate::error::BrokerError> {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            Ok(serde_json::Value::Bool(true))
        }
    }

    struct StubThing {
        id: String,
        properties: PropertyRegistry,
        actions: ActionRegistry,
    }
    impl Thing for StubThing {
        fn id(&self) -> &str {
            &self.id
        }
        fn properties(&self) -> &PropertyRegistry {
            &self.properties
        }
        fn actions(&self) -> &ActionRegistry {
            &self.actions
        }
    }

    fn make_thing(slow: bool) -> Arc<dyn Thing> {
        let mut actions = ActionRegistry::new();
        if slow {
            actions.insert("run", crate::thing::RegisteredAction::Async(Arc::new(SlowAction)));
        } else {
            actions.insert("run", crate::thing::RegisteredAction::Sync(Arc::new(NoopAction)));
        }
        Arc::new(StubThing {
            id: "thing-0".into(),
            properties: PropertyRegistry::new(),
            actions,
        })
    }

    async fn send_and_await_reply(
        dispatcher: &Dispatcher,
        server_exec_ctx: ServerExecContext,
    ) -> Option<ReplyFrame> {
        let codecs = CodecRegistry::new();
        let payload = codecs.encode("application/json", &serde_json::json!({})).unwrap();
        let request = RequestFrame::operation(
            Bytes::from_static(b"client"),
            Bytes::from_static(b"thing-0"),
            Bytes::from_static(b"run"),
            Operation::InvokeAction,
            payload,
            server_exec_ctx,
            ThingExecContext::default(),
        );
        let (client_side, origin_side) = InprocEndpoint::pair();
        let origin: SharedEndpoint = Arc::new(Mutex::new(origin_side));
        dispatcher.enqueue(QueuedRequest::new(request, origin)).ok().unwrap();

        let mut client_side = client_side;
        tokio::time::timeout(StdDuration::from_secs(2), client_side.recv_multipart())
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|parts| ReplyFrame::from_parts(&parts).unwrap())
    }

    #[tokio::test]
    async fn fast_action_replies_normally() {
        let (dispatcher, _handle) = Dispatcher::spawn(make_thing(false), Arc::new(CodecRegistry::new()));
        let mut ctx = ServerExecContext::default();
        ctx.execution_timeout = Some(1.0);
        let reply = send_and_await_reply(&dispatcher, ctx).await.unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
    }

    #[tokio::test]
    async fn execution_timeout_fires_before_slow_action_completes() {
        let (dispatcher, _handle) = Dispatcher::spawn(make_thing(true), Arc::new(CodecRegistry::new()));
        let mut ctx = ServerExecContext::default();
        ctx.execution_timeout = Some(0.02);
        ctx.invocation_timeout = None;
        let reply = send_and_await_reply(&dispatcher, ctx).await.unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Timeout);
    }

    #[tokio::test]
    async fn oneway_request_gets_no_reply() {
        let (dispatcher, _handle) = Dispatcher::spawn(make_thing(false), Arc::new(CodecRegistry::new()));
        let mut ctx = ServerExecContext::default();
        ctx.oneway = true;
        let reply = send_and_await_reply(&dispatcher, ctx).await;
        assert!(reply.is_none());
    }
}
