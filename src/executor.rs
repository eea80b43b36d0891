//! Per-Thing single-threaded operation executor.
//!
//! One Executor task owns exactly one Thing and receives exactly one
//! request at a time over its inproc endpoint from the owning
//! [`crate::dispatcher::Dispatcher`] — an actor, not a worker pool slot.
//! Operation dispatch is a tagged match over [`Operation`], replacing the
//! dynamic `getattr`/string-keyed dispatch the original Python executor
//! uses (`execute_once` in `rpc_server.py`), per the redesign guidance to
//! prefer a tagged sum of operations over dynamic dispatch.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::codec::{CodecRegistry, TypedPayload};
use crate::endpoint::{Endpoint, InprocEndpoint};
use crate::error::BrokerError;
use crate::execution_log::with_execution_log_capture;
use crate::frame::{Operation, ReplyKind, RequestFrame};
use crate::thing::{ActionArgs, RegisteredAction, Thing};

/// Runs the dispatch loop for one Thing until its endpoint closes.
pub struct Executor {
    thing: Arc<dyn Thing>,
    endpoint: InprocEndpoint,
    codecs: Arc<CodecRegistry>,
}

impl Executor {
    /// Build an executor for `thing`, communicating over `endpoint`.
    pub fn new(thing: Arc<dyn Thing>, endpoint: InprocEndpoint, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            thing,
            endpoint,
            codecs,
        }
    }

    /// Run until the Dispatcher-side endpoint is dropped.
    pub async fn run(mut self) {
        loop {
            let parts = match self.endpoint.recv_multipart().await {
                Ok(parts) => parts,
                Err(_) => {
                    log::debug!("executor for thing '{}' exiting: endpoint closed", self.thing.id());
                    return;
                }
            };
            let request = match RequestFrame::from_parts(&parts) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("executor for thing '{}' received malformed request: {e}", self.thing.id());
                    continue;
                }
            };
            let reply = self.handle(&request).await;
            if let Err(e) = self.endpoint.send_multipart(reply).await {
                log::warn!("executor for thing '{}' failed to send reply: {e}", self.thing.id());
            }
            if self.thing.shutdown_requested() {
                log::info!("executor for thing '{}' exiting: shutdown requested", self.thing.id());
                return;
            }
        }
    }

    async fn handle(&self, request: &RequestFrame) -> Vec<Bytes> {
        let fetch_logs = request.thing_exec_ctx.fetch_execution_logs;
        let (outcome, logs) = with_execution_log_capture(self.execute(request)).await;

        let (kind, data) = match outcome {
            Ok(value) => {
                let payload = self.encode_result(request, value, fetch_logs, logs);
                (ReplyKind::Reply, payload)
            }
            Err(e) => {
                log::error!("thing '{}' operation failed: {e}", self.thing.id());
                let value = exception_value(&e, fetch_logs, logs);
                let payload = self.codecs.encode(content_type_of(request), &value).ok();
                (ReplyKind::Exception, payload)
            }
        };

        crate::frame::ReplyFrame::for_request(request, kind, data).to_parts()
    }

    fn encode_result(
        &self,
        request: &RequestFrame,
        value: Value,
        fetch_logs: bool,
        logs: Vec<String>,
    ) -> Option<TypedPayload> {
        let value = if fetch_logs {
            let mut wrapper = Map::new();
            wrapper.insert("return_value".to_string(), value);
            wrapper.insert("execution_logs".to_string(), Value::from(logs));
            Value::Object(wrapper)
        } else {
            value
        };
        self.codecs.encode(content_type_of(request), &value).ok()
    }

    async fn execute(&self, request: &RequestFrame) -> Result<Value, BrokerError> {
        let operation = request
            .operation
            .clone()
            .ok_or_else(|| BrokerError::Malformed("request carries no operation".into()))?;
        let payload = request
            .payload
            .as_ref()
            .ok_or_else(|| BrokerError::Malformed("request carries no payload".into()))?;
        let object_name = std::str::from_utf8(&request.object_name)
            .map_err(|e| BrokerError::Malformed(format!("object name not utf8: {e}")))?;

        match operation {
            Operation::ReadProperty => {
                let property = self.property(object_name)?;
                property.read()
            }
            Operation::WriteProperty => {
                let property = self.property(object_name)?;
                let value = self.codecs.decode(payload)?;
                property.write(value)?;
                Ok(Value::Null)
            }
            Operation::DeleteProperty => {
                let property = self.property(object_name)?;
                property.delete()?;
                Ok(Value::Null)
            }
            Operation::InvokeAction => {
                let action = self
                    .thing
                    .actions()
                    .get(object_name)
                    .ok_or_else(|| BrokerError::UnknownTarget(format!("no such action: {object_name}")))?;
                let args = parse_action_args(self.codecs.decode(payload)?)?;
                match action.as_ref() {
                    RegisteredAction::Sync(action) => action.invoke(args),
                    RegisteredAction::Async(action) => action.invoke(args).await,
                }
            }
            Operation::ReadAllProperties => self.read_all_properties(),
            Operation::ReadMultipleProperties => {
                // An empty `object` names no subset: read every property,
                // same as readAllProperties.
                if object_name.is_empty() {
                    return self.read_all_properties();
                }
                let names = parse_name_list(self.codecs.decode(payload)?)?;
                let mut out = Map::new();
                for name in names {
                    let property = self.property(&name)?;
                    out.insert(name, property.read()?);
                }
                Ok(Value::Object(out))
            }
            Operation::WriteAllProperties | Operation::WriteMultipleProperties => {
                let values = match self.codecs.decode(payload)? {
                    Value::Object(map) => map,
                    _ => return Err(BrokerError::Malformed("expected an object of property values".into())),
                };
                for (name, value) in values {
                    let property = self.property(&name)?;
                    property.write(value)?;
                }
                Ok(Value::Null)
            }
            Operation::Unknown(token) => Err(BrokerError::Unsupported(format!("unknown operation: {token}"))),
        }
    }

    fn read_all_properties(&self) -> Result<Value, BrokerError> {
        let mut out = Map::new();
        for name in self.thing.properties().names() {
            let property = self.thing.properties().get(name).expect("name came from registry");
            out.insert(name.to_string(), property.read()?);
        }
        Ok(Value::Object(out))
    }

    fn property(&self, name: &str) -> Result<&Arc<dyn crate::thing::Property>, BrokerError> {
        self.thing
            .properties()
            .get(name)
            .ok_or_else(|| BrokerError::UnknownTarget(format!("no such property: {name}")))
    }
}

fn content_type_of(request: &RequestFrame) -> &str {
    request
        .payload
        .as_ref()
        .map(|p| p.content_type.as_str())
        .unwrap_or("application/json")
}

fn exception_value(error: &BrokerError, fetch_logs: bool, logs: Vec<String>) -> Value {
    let mut out = Map::new();
    out.insert("exception".to_string(), Value::String(error.to_string()));
    if fetch_logs {
        out.insert("execution_logs".to_string(), Value::from(logs));
    }
    Value::Object(out)
}

fn parse_action_args(value: Value) -> Result<ActionArgs, BrokerError> {
    let Value::Object(mut map) = value else {
        return Err(BrokerError::Malformed("action payload must be an object".into()));
    };
    let args = match map.remove("__args__") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(BrokerError::Malformed("__args__ must be an array".into())),
        None => Vec::new(),
    };
    Ok(ActionArgs {
        args,
        kwargs: map.into_iter().collect(),
    })
}

fn parse_name_list(value: Value) -> Result<Vec<String>, BrokerError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| BrokerError::Malformed("property name list must contain strings".into()))
            })
            .collect(),
        _ => Err(BrokerError::Malformed("expected an array of property names".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::frame::{RequestFrame, ServerExecContext, ThingExecContext};
    use crate::thing::{Action, ActionRegistry, PropertyRegistry};
    use std::sync::Mutex;

    struct Lamp {
        on: Mutex<bool>,
        properties: PropertyRegistry,
        actions: ActionRegistry,
    }

    struct OnOff<'a>(&'a Mutex<bool>);

    impl crate::thing::Property for OnOff<'_> {
        fn read(&self) -> Result<Value, BrokerError> {
            Ok(Value::Bool(*self.0.lock().unwrap()))
        }
        fn write(&self, value: Value) -> Result<(), BrokerError> {
            *self.0.lock().unwrap() = value.as_bool().unwrap_or(false);
            Ok(())
        }
    }

    struct Toggle;
    impl Action for Toggle {
        fn invoke(&self, _args: ActionArgs) -> Result<Value, BrokerError> {
            Ok(Value::String("toggled".into()))
        }
    }

    struct Brightness<'a>(&'a Mutex<i64>);

    impl crate::thing::Property for Brightness<'_> {
        fn read(&self) -> Result<Value, BrokerError> {
            Ok(Value::from(*self.0.lock().unwrap()))
        }
        fn write(&self, value: Value) -> Result<(), BrokerError> {
            *self.0.lock().unwrap() = value.as_i64().unwrap_or(0);
            Ok(())
        }
    }

    fn make_lamp() -> Arc<dyn Thing> {
        // Leak static Mutexes so the property wrappers can borrow them for
        // 'static; test-only.
        let on: &'static Mutex<bool> = Box::leak(Box::new(Mutex::new(false)));
        let brightness: &'static Mutex<i64> = Box::leak(Box::new(Mutex::new(50)));
        let mut properties = PropertyRegistry::new();
        properties.insert("on", Arc::new(OnOff(on)));
        properties.insert("brightness", Arc::new(Brightness(brightness)));
        let mut actions = ActionRegistry::new();
        actions.insert("toggle", RegisteredAction::Sync(Arc::new(Toggle)));
        Arc::new(LampHandle { id: "lamp-0".into(), properties, actions })
    }

    struct LampHandle {
        id: String,
        properties: PropertyRegistry,
        actions: ActionRegistry,
    }
    impl Thing for LampHandle {
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

    fn request(operation: Operation, object: &str, payload: Value) -> RequestFrame {
        let codecs = CodecRegistry::new();
        let payload = codecs.encode("application/json", &payload).unwrap();
        RequestFrame::operation(
            Bytes::from_static(b"client"),
            Bytes::from_static(b"lamp-0"),
            Bytes::copy_from_slice(object.as_bytes()),
            operation,
            payload,
            ServerExecContext::default(),
            ThingExecContext::default(),
        )
    }

    #[tokio::test]
    async fn read_property_returns_current_value() {
        let (a, b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::ReadProperty, "on", Value::Null);
        let mut b = b;
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded, Value::Bool(false));
    }

    #[tokio::test]
    async fn write_then_read_property_round_trips() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let write = request(Operation::WriteProperty, "on", Value::Bool(true));
        b.send_multipart(write.to_parts()).await.unwrap();
        let _ = b.recv_multipart().await.unwrap();

        let read = request(Operation::ReadProperty, "on", Value::Null);
        b.send_multipart(read.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded, Value::Bool(true));
    }

    #[tokio::test]
    async fn invoke_action_returns_result() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::InvokeAction, "toggle", serde_json::json!({}));
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded, Value::String("toggled".into()));
    }

    #[tokio::test]
    async fn unknown_property_is_exception() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::ReadProperty, "brightness", Value::Null);
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Exception);
    }

    #[tokio::test]
    async fn fetch_execution_logs_wraps_return_value() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let codecs = CodecRegistry::new();
        let payload = codecs.encode("application/json", &Value::Null).unwrap();
        let mut req = RequestFrame::operation(
            Bytes::from_static(b"client"),
            Bytes::from_static(b"lamp-0"),
            Bytes::from_static(b"on"),
            Operation::ReadProperty,
            payload,
            ServerExecContext::default(),
            ThingExecContext::default(),
        );
        req.thing_exec_ctx.fetch_execution_logs = true;
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert!(decoded.get("return_value").is_some());
        assert!(decoded.get("execution_logs").is_some());
    }

    #[tokio::test]
    async fn read_all_properties_returns_every_property() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::ReadAllProperties, "", Value::Null);
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded.get("on"), Some(&Value::Bool(false)));
        assert_eq!(decoded.get("brightness"), Some(&Value::from(50)));
    }

    #[tokio::test]
    async fn read_multiple_properties_with_empty_object_reads_all() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::ReadMultipleProperties, "", Value::Null);
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded.get("on"), Some(&Value::Bool(false)));
        assert_eq!(decoded.get("brightness"), Some(&Value::from(50)));
    }

    #[tokio::test]
    async fn read_multiple_properties_with_names_reads_only_those() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::ReadMultipleProperties, "", serde_json::json!(["brightness"]));
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded.get("brightness"), Some(&Value::from(50)));
        assert!(decoded.get("on").is_none());
    }

    #[tokio::test]
    async fn write_multiple_properties_writes_each_named_value() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let write = request(
            Operation::WriteMultipleProperties,
            "",
            serde_json::json!({"on": true, "brightness": 75}),
        );
        b.send_multipart(write.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);

        let read = request(Operation::ReadAllProperties, "", Value::Null);
        b.send_multipart(read.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded.get("on"), Some(&Value::Bool(true)));
        assert_eq!(decoded.get("brightness"), Some(&Value::from(75)));
    }

    #[tokio::test]
    async fn write_all_properties_writes_every_property() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let write = request(
            Operation::WriteAllProperties,
            "",
            serde_json::json!({"on": true, "brightness": 10}),
        );
        b.send_multipart(write.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);

        let read = request(Operation::ReadProperty, "brightness", Value::Null);
        b.send_multipart(read.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        let decoded = reply.decode_data(&CodecRegistry::new()).unwrap().unwrap();
        assert_eq!(decoded, Value::from(10));
    }

    #[tokio::test]
    async fn unknown_operation_token_is_exception() {
        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(make_lamp(), a, Arc::new(CodecRegistry::new()));
        tokio::spawn(executor.run());

        let req = request(Operation::Unknown("subscribeEvent".into()), "on", Value::Null);
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Exception);
    }

    struct ShutdownNow(std::sync::Arc<std::sync::atomic::AtomicBool>);
    impl Action for ShutdownNow {
        fn invoke(&self, _args: ActionArgs) -> Result<Value, BrokerError> {
            self.0.store(true, std::sync::atomic::Ordering::Release);
            Ok(Value::String("bye".into()))
        }
    }

    struct QuittingThing {
        id: String,
        properties: PropertyRegistry,
        actions: ActionRegistry,
        quit: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }
    impl Thing for QuittingThing {
        fn id(&self) -> &str {
            &self.id
        }
        fn properties(&self) -> &PropertyRegistry {
            &self.properties
        }
        fn actions(&self) -> &ActionRegistry {
            &self.actions
        }
        fn shutdown_requested(&self) -> bool {
            self.quit.load(std::sync::atomic::Ordering::Acquire)
        }
    }

    #[tokio::test]
    async fn shutdown_requested_ends_the_executor_after_the_reply() {
        let quit = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut actions = ActionRegistry::new();
        actions.insert("quit", RegisteredAction::Sync(Arc::new(ShutdownNow(quit.clone()))));
        let thing: Arc<dyn Thing> = Arc::new(QuittingThing {
            id: "quitter-0".into(),
            properties: PropertyRegistry::new(),
            actions,
            quit,
        });

        let (a, mut b) = InprocEndpoint::pair();
        let executor = Executor::new(thing, a, Arc::new(CodecRegistry::new()));
        let handle = tokio::spawn(executor.run());

        let codecs = CodecRegistry::new();
        let payload = codecs.encode("application/json", &serde_json::json!({})).unwrap();
        let req = RequestFrame::operation(
            Bytes::from_static(b"client"),
            Bytes::from_static(b"quitter-0"),
            Bytes::from_static(b"quit"),
            Operation::InvokeAction,
            payload,
            ServerExecContext::default(),
            ThingExecContext::default(),
        );
        b.send_multipart(req.to_parts()).await.unwrap();
        let reply_parts = b.recv_multipart().await.unwrap();
        let reply = crate::frame::ReplyFrame::from_parts(&reply_parts).unwrap();
        assert_eq!(reply.msg_type, ReplyKind::Reply);

        // The Executor exits on its own after emitting that reply; its task
        // completes without needing the endpoint to be dropped.
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("executor task to finish")
            .unwrap();
    }
}
