//! Stands up a broker fronting a single "lamp" Thing over an in-process
//! transport, drives it through a handshake, a property write/read and an
//! action invocation, then shuts down cleanly. Run with
//! `cargo run --example broker_demo`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use thing_broker::{
    Action, ActionArgs, ActionRegistry, Broker, BrokerConfig, BrokerError, CodecRegistry, Endpoint,
    MsgType, Operation, Property, PropertyRegistry, RegisteredAction, ReplyFrame, RequestFrame,
    ServerExecContext, Thing, ThingExecContext,
};

struct OnOff(Arc<AtomicBool>);

impl Property for OnOff {
    fn read(&self) -> Result<Value, BrokerError> {
        Ok(Value::Bool(self.0.load(Ordering::Acquire)))
    }

    fn write(&self, value: Value) -> Result<(), BrokerError> {
        let on = value
            .as_bool()
            .ok_or_else(|| BrokerError::UserException("expected a boolean".into()))?;
        self.0.store(on, Ordering::Release);
        Ok(())
    }
}

struct Toggle(Arc<AtomicBool>);

impl Action for Toggle {
    fn invoke(&self, _args: ActionArgs) -> Result<Value, BrokerError> {
        let was_on = self.0.fetch_xor(true, Ordering::AcqRel);
        Ok(Value::Bool(!was_on))
    }
}

struct Lamp {
    properties: PropertyRegistry,
    actions: ActionRegistry,
}

impl Thing for Lamp {
    fn id(&self) -> &str {
        "lamp-0"
    }

    fn properties(&self) -> &PropertyRegistry {
        &self.properties
    }

    fn actions(&self) -> &ActionRegistry {
        &self.actions
    }
}

fn build_lamp() -> Arc<dyn Thing> {
    // Shared between the property and the action so toggling the lamp is
    // visible through both.
    let state = Arc::new(AtomicBool::new(false));
    let mut properties = PropertyRegistry::new();
    properties.insert("on", Arc::new(OnOff(state.clone())));
    let mut actions = ActionRegistry::new();
    actions.insert("toggle", RegisteredAction::Sync(Arc::new(Toggle(state))));
    Arc::new(Lamp { properties, actions })
}

async fn send(client: &mut Box<dyn Endpoint>, request: RequestFrame) -> ReplyFrame {
    client.send_multipart(request.to_parts()).await.expect("send request");
    let parts = client.recv_multipart().await.expect("recv reply");
    ReplyFrame::from_parts(&parts).expect("decode reply")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let broker = Broker::new(BrokerConfig::default());
    broker.start().await?;
    broker.attach(build_lamp())?;

    let mut client = broker.connect_inproc();
    let codecs = CodecRegistry::new();

    let handshake = send(&mut client, RequestFrame::plain(Bytes::from_static(b"demo-client"), MsgType::Handshake)).await;
    log::info!("handshake replied: {:?}", handshake.msg_type);

    let write = send(
        &mut client,
        RequestFrame::operation(
            Bytes::from_static(b"demo-client"),
            Bytes::from_static(b"lamp-0"),
            Bytes::from_static(b"on"),
            Operation::WriteProperty,
            codecs.encode("application/json", &json!(true))?,
            ServerExecContext::default(),
            ThingExecContext::default(),
        ),
    )
    .await;
    log::info!("write replied: {:?}", write.msg_type);

    let read = send(
        &mut client,
        RequestFrame::operation(
            Bytes::from_static(b"demo-client"),
            Bytes::from_static(b"lamp-0"),
            Bytes::from_static(b"on"),
            Operation::ReadProperty,
            codecs.encode("application/json", &Value::Null)?,
            ServerExecContext::default(),
            ThingExecContext::default(),
        ),
    )
    .await;
    let value = read.decode_data(&codecs)?;
    log::info!("lamp is on: {value:?}");

    let toggled = send(
        &mut client,
        RequestFrame::operation(
            Bytes::from_static(b"demo-client"),
            Bytes::from_static(b"lamp-0"),
            Bytes::from_static(b"toggle"),
            Operation::InvokeAction,
            codecs.encode("application/json", &json!({}))?,
            ServerExecContext::default(),
            ThingExecContext::default(),
        ),
    )
    .await;
    log::info!("toggle replied: {:?}", toggled.decode_data(&codecs)?);

    broker.stop().await?;
    Ok(())
}
