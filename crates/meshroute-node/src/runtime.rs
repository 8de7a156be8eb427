//! Node runtime orchestration.
//!
//! A single task owns the [`RoutingEngine`]. Connections talk to it through a
//! cloneable [`NodeHandle`]; everything the engine emits is dispatched to the
//! sinks after each command. Advertisement debouncing and the redirection
//! timeout run on the same task.

use crate::config::NodeConfig;
use crate::engine::{EngineSnapshot, RoutingEngine};
use crate::error::{NodeError, RoutingError};
use crate::outbox::Outbound;
use crate::sink::{ApplicationSink, NeighborSink};
use meshroute_core::{ApplicationId, BrokerId, DataItemKey, Origin, RequestId, Role, UserId};
use meshroute_proto::Telegram;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Reply<T> = oneshot::Sender<Result<T, RoutingError>>;

#[derive(Debug)]
enum Command {
    RequestCentralRole {
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
        reply: Reply<RequestId>,
    },
    RequestParticipant {
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
        reply: Reply<RequestId>,
    },
    Unsubscribe {
        app: ApplicationId,
        key: DataItemKey,
        role: Role,
    },
    Publish {
        app: ApplicationId,
        key: DataItemKey,
        index: u64,
        payload: Vec<u8>,
    },
    Telegram {
        from: BrokerId,
        telegram: Telegram,
    },
    RouteChanged {
        target: BrokerId,
    },
    ConnectionClosed {
        origin: Origin,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown,
}

/// Cloneable access to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn send(&self, command: Command) -> Result<(), NodeError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| NodeError::ChannelClosed)
    }

    /// Ask for the Source or Drain role of `key` on behalf of `app`.
    ///
    /// # Errors
    ///
    /// Returns error if the role is taken or not central, or if the node
    /// has stopped.
    pub async fn request_central_role(
        &self,
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
    ) -> Result<RequestId, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestCentralRole {
            app,
            user,
            key,
            role,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| NodeError::ChannelClosed)??)
    }

    /// Subscribe `app` as Sender or Receiver of `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the role is central or if the node has stopped.
    pub async fn request_participant(
        &self,
        app: ApplicationId,
        user: UserId,
        key: DataItemKey,
        role: Role,
    ) -> Result<RequestId, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestParticipant {
            app,
            user,
            key,
            role,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| NodeError::ChannelClosed)??)
    }

    /// Drop a subscription of `app`.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn unsubscribe(
        &self,
        app: ApplicationId,
        key: DataItemKey,
        role: Role,
    ) -> Result<(), NodeError> {
        self.send(Command::Unsubscribe { app, key, role }).await
    }

    /// Publish a value from `app`.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn publish(
        &self,
        app: ApplicationId,
        key: DataItemKey,
        index: u64,
        payload: Vec<u8>,
    ) -> Result<(), NodeError> {
        self.send(Command::Publish {
            app,
            key,
            index,
            payload,
        })
        .await
    }

    /// Hand over a telegram received from neighbor `from`.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn deliver_telegram(
        &self,
        from: BrokerId,
        telegram: Telegram,
    ) -> Result<(), NodeError> {
        self.send(Command::Telegram { from, telegram }).await
    }

    /// Tell the node the next hop towards `target` may have changed.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn route_changed(&self, target: BrokerId) -> Result<(), NodeError> {
        self.send(Command::RouteChanged { target }).await
    }

    /// Tell the node a connection went away.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn connection_closed(&self, origin: Origin) -> Result<(), NodeError> {
        self.send(Command::ConnectionClosed { origin }).await
    }

    /// Fetch a diagnostic snapshot of the routing state.
    ///
    /// # Errors
    ///
    /// Returns error if the node has stopped.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Stop the node.
    ///
    /// # Errors
    ///
    /// Returns error if the node has already stopped.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.send(Command::Shutdown).await
    }
}

/// The task owning a node's routing state.
pub struct NodeRuntime {
    engine: RoutingEngine,
    rx: mpsc::Receiver<Command>,
    neighbors: Arc<dyn NeighborSink>,
    applications: Arc<dyn ApplicationSink>,
    redirection_timeout: Option<Duration>,
    seeded_routes: Vec<BrokerId>,
}

impl NodeRuntime {
    /// Start the runtime on the current tokio runtime.
    ///
    /// Every target in `config.static_routes` is announced to the engine as a
    /// route change before the first command, so advertisements for those
    /// brokers are subscribed right away.
    #[must_use]
    pub fn spawn(
        config: &NodeConfig,
        engine: RoutingEngine,
        neighbors: Arc<dyn NeighborSink>,
        applications: Arc<dyn ApplicationSink>,
    ) -> (NodeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let runtime = Self {
            engine,
            rx,
            neighbors,
            applications,
            redirection_timeout: config.redirection_timeout,
            seeded_routes: config.static_routes.keys().copied().collect(),
        };
        let task = tokio::spawn(runtime.run());
        (NodeHandle { tx }, task)
    }

    async fn run(mut self) {
        tracing::info!(
            broker = %self.engine.own_id(),
            routes = self.seeded_routes.len(),
            "Starting node runtime"
        );

        let now = std::time::Instant::now();
        for target in std::mem::take(&mut self.seeded_routes) {
            self.engine.on_route_changed(target, now);
        }
        self.dispatch();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle(command) {
                        break;
                    }
                }
                () = sleep_until(deadline) => {
                    let now = std::time::Instant::now();
                    self.engine.flush_advertisements(now);
                    if let Some(timeout) = self.redirection_timeout {
                        self.engine.expire_redirections(now, timeout);
                    }
                }
            }
            self.dispatch();
        }

        tracing::info!(broker = %self.engine.own_id(), "Node runtime stopped");
    }

    /// Returns `false` when the runtime should stop.
    fn handle(&mut self, command: Command) -> bool {
        let now = std::time::Instant::now();
        match command {
            Command::RequestCentralRole {
                app,
                user,
                key,
                role,
                reply,
            } => {
                let result = self.engine.request_central_role(app, user, key, role, now);
                let _ = reply.send(result);
            }
            Command::RequestParticipant {
                app,
                user,
                key,
                role,
                reply,
            } => {
                let result = self.engine.request_participant(app, user, key, role, now);
                let _ = reply.send(result);
            }
            Command::Unsubscribe { app, key, role } => {
                self.engine.unsubscribe(app, key, role, now);
            }
            Command::Publish {
                app,
                key,
                index,
                payload,
            } => self.engine.publish(app, key, index, payload),
            Command::Telegram { from, telegram } => {
                self.engine.handle_telegram(from, telegram, now);
            }
            Command::RouteChanged { target } => self.engine.on_route_changed(target, now),
            Command::ConnectionClosed { origin } => self.engine.connection_closed(origin, now),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Shutdown => {
                tracing::info!(broker = %self.engine.own_id(), "Shutdown requested");
                return false;
            }
        }
        true
    }

    fn next_deadline(&self) -> Option<std::time::Instant> {
        let adverts = self.engine.next_advertisement_deadline();
        let redirections = self
            .redirection_timeout
            .and_then(|timeout| self.engine.next_redirection_deadline(timeout));
        match (adverts, redirections) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    fn dispatch(&mut self) {
        for outbound in self.engine.take_outbox() {
            match outbound {
                Outbound::Neighbor { to, telegram } => {
                    let kind = telegram.kind();
                    if let Err(err) = self.neighbors.send(to, telegram) {
                        tracing::warn!(error = %err, to = %to, kind, "Failed to send telegram");
                    }
                }
                Outbound::Application { to, event } => {
                    if let Err(err) = self.applications.notify(to, event) {
                        tracing::warn!(error = %err, to = %to, "Failed to notify application");
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
