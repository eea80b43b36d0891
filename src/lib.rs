// Library modules
pub mod broker;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod execution_log;
pub mod executor;
pub mod frame;
pub mod listener;
pub mod publisher;
pub mod thing;

// Re-export commonly used types
pub use broker::{Broker, BrokerState};
pub use codec::{Codec, CodecRegistry, TypedPayload};
pub use config::{BrokerConfig, TransportBind};
pub use dispatcher::{Dispatcher, QueuedRequest};
pub use endpoint::{Endpoint, EventEndpoint, InprocEndpoint, IpcEndpoint, TcpEndpoint};
pub use error::BrokerError;
pub use frame::{
    MsgType, Operation, ReplyFrame, ReplyKind, RequestFrame, ServerExecContext, ThingExecContext,
};
pub use listener::{Listener, ThingRegistry};
pub use publisher::EventPublisher;
pub use thing::{Action, ActionArgs, ActionRegistry, AsyncAction, Property, PropertyRegistry, RegisteredAction, Thing};
