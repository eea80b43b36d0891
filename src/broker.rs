//! Broker supervisor.
//!
//! Owns the Thing registry, binds every configured transport, and carries
//! the broker through its one-way lifecycle:
//! `Created -> Running -> Stopping -> Stopped`. Mirrors the original
//! source's `RPCServer.run`/`RPCServer.stop` shape: `start` brings up
//! listeners, `attach` registers a Thing's Dispatcher so listeners can route
//! to it, and `stop` flips a shared stop flag and force-closes every open
//! connection to unblock any Listener parked in `recv_multipart`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::codec::CodecRegistry;
use crate::config::{BrokerConfig, TransportBind};
use crate::dispatcher::{Dispatcher, SharedEndpoint};
use crate::endpoint::{Endpoint, InprocEndpoint, IpcEndpoint, TcpEndpoint};
use crate::listener::{Listener, ThingRegistry};
use crate::thing::Thing;

/// How often an accept loop polls the shared stop flag between connections.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Broker lifecycle state. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, not yet started.
    Created,
    /// Listening on every configured transport; `attach` is permitted.
    Running,
    /// `stop()` has been called; draining in progress.
    Stopping,
    /// Fully stopped. Terminal.
    Stopped,
}

impl BrokerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BrokerState::Created,
            1 => BrokerState::Running,
            2 => BrokerState::Stopping,
            _ => BrokerState::Stopped,
        }
    }
}

/// Front-ends one or more Things to remote clients over one or more bound
/// transports.
pub struct Broker {
    config: BrokerConfig,
    state: AtomicU8,
    things: Arc<ThingRegistry>,
    codecs: Arc<CodecRegistry>,
    stop: Arc<AtomicBool>,
    listener_tasks: StdMutex<Vec<JoinHandle<()>>>,
    dispatcher_tasks: StdMutex<Vec<JoinHandle<()>>>,
    open_connections: Arc<StdMutex<Vec<SharedEndpoint>>>,
}

impl Broker {
    /// Build a broker in the `Created` state. Call [`Broker::start`] to
    /// bind its configured transports.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BrokerState::Created as u8),
            things: Arc::new(ThingRegistry::new()),
            codecs: Arc::new(CodecRegistry::new()),
            stop: Arc::new(AtomicBool::new(false)),
            listener_tasks: StdMutex::new(Vec::new()),
            dispatcher_tasks: StdMutex::new(Vec::new()),
            open_connections: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        BrokerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bind every transport in the broker's configuration and start
    /// accepting connections. Transitions `Created -> Running`.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.state() != BrokerState::Created {
            anyhow::bail!("broker can only be started from the Created state, currently {:?}", self.state());
        }
        for transport in &self.config.transports {
            match transport {
                TransportBind::Inproc => {
                    log::info!("broker: inproc transport ready, connect via Broker::connect_inproc");
                }
                TransportBind::Ipc(path) => self.bind_ipc(path.clone()).await?,
                TransportBind::Tcp(addr) => self.bind_tcp(addr.clone()).await?,
            }
        }
        self.state.store(BrokerState::Running as u8, Ordering::Release);
        log::info!("broker running with {} transport(s)", self.config.transports.len());
        Ok(())
    }

    async fn bind_ipc(&self, path: String) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        log::info!("broker: bound ipc transport at {path}");
        let things = self.things.clone();
        let stop = self.stop.clone();
        let open_connections = self.open_connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let accepted = tokio::select! {
                    biased;
                    result = listener.accept() => result,
                    _ = tokio::time::sleep(ACCEPT_POLL_INTERVAL) => continue,
                };
                let stream = match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        log::warn!("ipc accept failed: {e}");
                        continue;
                    }
                };
                spawn_connection_listener(Box::new(IpcEndpoint::new(stream)), &things, &stop, &open_connections);
            }
            log::info!("ipc acceptor for {path} stopped");
        });
        self.listener_tasks.lock().expect("listener tasks lock poisoned").push(handle);
        Ok(())
    }

    async fn bind_tcp(&self, addr: String) -> anyhow::Result<()> {
        let socket_addr: SocketAddr = addr.parse()?;
        let listener = TcpListener::bind(socket_addr).await?;
        log::info!("broker: bound tcp transport at {socket_addr}");
        let things = self.things.clone();
        let stop = self.stop.clone();
        let open_connections = self.open_connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let accepted = tokio::select! {
                    biased;
                    result = listener.accept() => result,
                    _ = tokio::time::sleep(ACCEPT_POLL_INTERVAL) => continue,
                };
                let stream = match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        log::warn!("tcp accept failed: {e}");
                        continue;
                    }
                };
                spawn_connection_listener(Box::new(TcpEndpoint::new(stream)), &things, &stop, &open_connections);
            }
            log::info!("tcp acceptor for {socket_addr} stopped");
        });
        self.listener_tasks.lock().expect("listener tasks lock poisoned").push(handle);
        Ok(())
    }

    /// Pair a fresh in-process endpoint, hand the client side back to the
    /// caller and spawn a Listener over the broker side. Valid in any
    /// state; `Running` is the only state in which requests sent over it
    /// will actually reach a Thing.
    pub fn connect_inproc(&self) -> Box<dyn Endpoint> {
        let (client_side, broker_side) = InprocEndpoint::pair();
        spawn_connection_listener(Box::new(broker_side), &self.things, &self.stop, &self.open_connections);
        Box::new(client_side)
    }

    /// Register `thing`, spawning its Dispatcher and Executor. Only valid
    /// while the broker is `Running`.
    pub fn attach(&self, thing: Arc<dyn Thing>) -> anyhow::Result<()> {
        if self.state() != BrokerState::Running {
            anyhow::bail!("attach is only permitted while the broker is Running, currently {:?}", self.state());
        }
        let thing_id = thing.id().to_string();
        let (dispatcher, handle) = Dispatcher::spawn(thing, self.codecs.clone());
        self.things.insert(thing_id.clone(), dispatcher);
        self.dispatcher_tasks.lock().expect("dispatcher tasks lock poisoned").push(handle);
        log::info!("broker: attached thing '{thing_id}'");
        Ok(())
    }

    /// Stop accepting new connections, force-close every open connection to
    /// unblock any Listener parked in `recv_multipart`, and wait for every
    /// listener and dispatcher task to finish. Transitions
    /// `Running -> Stopping -> Stopped`.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if self.state() == BrokerState::Created {
            anyhow::bail!("cannot stop a broker that was never started");
        }
        if self.state() == BrokerState::Stopped {
            return Ok(());
        }
        self.state.store(BrokerState::Stopping as u8, Ordering::Release);
        self.stop.store(true, Ordering::Release);

        let connections: Vec<SharedEndpoint> = self
            .open_connections
            .lock()
            .expect("open connections lock poisoned")
            .drain(..)
            .collect();
        for connection in connections {
            let mut endpoint = connection.lock().await;
            endpoint.close();
        }

        for handle in self.listener_tasks.lock().expect("listener tasks lock poisoned").drain(..) {
            let _ = handle.await;
        }

        // Drop every Dispatcher's inbox sender so each Thing's dispatch loop
        // sees its inbox close and exits, which in turn drops the executor
        // endpoint and ends the Executor. `attach` can no longer race with
        // this since the state left `Running` above.
        self.things.clear();
        for handle in self.dispatcher_tasks.lock().expect("dispatcher tasks lock poisoned").drain(..) {
            let _ = handle.await;
        }

        self.state.store(BrokerState::Stopped as u8, Ordering::Release);
        log::info!("broker stopped");
        Ok(())
    }
}

fn spawn_connection_listener(
    endpoint: Box<dyn Endpoint>,
    things: &Arc<ThingRegistry>,
    stop: &Arc<AtomicBool>,
    open_connections: &Arc<StdMutex<Vec<SharedEndpoint>>>,
) {
    let listener = Listener::new(endpoint, things.clone(), stop.clone());
    open_connections
        .lock()
        .expect("open connections lock poisoned")
        .push(listener.endpoint_handle());
    tokio::spawn(listener.run());
}
