//! One task per connection
//!
//! Every connection gets a dedicated task owning its protocol client. The
//! task consumes open/close commands from a bounded channel, answers each
//! with an acknowledgement carrying the resulting state, and publishes
//! state changes through a watch channel for observers. A close arriving
//! while a connect attempt is in flight cancels the attempt.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{self, ClientState, LifecycleEvent};
use crate::client::ProtocolClient;
use crate::config::TimeoutSection;
use crate::error::{ConnectivityError, ConnectivityResult};
use crate::model::ConnectionId;

const COMMAND_BUFFER: usize = 16;

/// Outcome of one lifecycle command.
#[derive(Debug)]
pub struct Acknowledgement {
    pub connection_id: ConnectionId,
    pub correlation_id: Uuid,
    /// Client state after the command settled.
    pub state: ClientState,
    pub error: Option<ConnectivityError>,
}

impl Acknowledgement {
    fn success(connection_id: ConnectionId, correlation_id: Uuid, state: ClientState) -> Self {
        Self {
            connection_id,
            correlation_id,
            state,
            error: None,
        }
    }

    fn failure(
        connection_id: ConnectionId,
        correlation_id: Uuid,
        state: ClientState,
        error: ConnectivityError,
    ) -> Self {
        Self {
            connection_id,
            correlation_id,
            state,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum ConnectionCommand {
    Open {
        correlation_id: Uuid,
        reply: oneshot::Sender<Acknowledgement>,
    },
    Close {
        correlation_id: Uuid,
        reply: oneshot::Sender<Acknowledgement>,
    },
}

/// Caller-side handle to a spawned connection task.
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    commands: mpsc::Sender<ConnectionCommand>,
    state: watch::Receiver<ClientState>,
    timeouts: TimeoutSection,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Current client state.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch receiver for observing state changes.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Request the connection be opened. Resolves with the acknowledgement,
    /// or a timeout error if none arrives within the connection deadline.
    pub async fn open(&self) -> ConnectivityResult<Acknowledgement> {
        self.send(|correlation_id, reply| ConnectionCommand::Open {
            correlation_id,
            reply,
        })
        .await
    }

    /// Request the connection be closed, draining in-flight publishes first.
    pub async fn close(&self) -> ConnectivityResult<Acknowledgement> {
        self.send(|correlation_id, reply| ConnectionCommand::Close {
            correlation_id,
            reply,
        })
        .await
    }

    async fn send(
        &self,
        make: impl FnOnce(Uuid, oneshot::Sender<Acknowledgement>) -> ConnectionCommand,
    ) -> ConnectivityResult<Acknowledgement> {
        let correlation_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(correlation_id, reply_tx))
            .await
            .map_err(|_| ConnectivityError::transport("connection task is gone"))?;

        // Headroom over the actor's own connect deadline, so a connect that
        // times out inside the task still surfaces as an acknowledgement
        // here instead of racing this wait.
        let deadline = self.timeouts.connection_timeout() + self.timeouts.command_timeout();
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ConnectivityError::transport(
                "connection task dropped the command",
            )),
            Err(_) => Err(ConnectivityError::timeout("lifecycle command", deadline)),
        }
    }

    /// Stop accepting commands and wait for the task to tear itself down.
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

/// The task body driving one protocol client through its lifecycle.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    client: Box<dyn ProtocolClient>,
    commands: mpsc::Receiver<ConnectionCommand>,
    state_tx: watch::Sender<ClientState>,
    timeouts: TimeoutSection,
}

impl ConnectionActor {
    /// Spawn the task for `client` and return the handle controlling it.
    pub fn spawn(
        connection_id: ConnectionId,
        client: Box<dyn ProtocolClient>,
        timeouts: TimeoutSection,
    ) -> ConnectionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ClientState::Closed);
        let actor = Self {
            connection_id: connection_id.clone(),
            client,
            commands: command_rx,
            state_tx,
            timeouts: timeouts.clone(),
        };
        let task = tokio::spawn(actor.run());
        ConnectionHandle {
            connection_id,
            commands: command_tx,
            state: state_rx,
            timeouts,
            task,
        }
    }

    fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    async fn run(mut self) {
        info!(connection_id = %self.connection_id, "connection task started");
        while let Some(command) = self.commands.recv().await {
            match command {
                ConnectionCommand::Open {
                    correlation_id,
                    reply,
                } => self.handle_open(correlation_id, reply).await,
                ConnectionCommand::Close {
                    correlation_id,
                    reply,
                } => self.handle_close(correlation_id, reply).await,
            }
        }
        // handle dropped; tear down whatever is still up
        if self.state() == ClientState::Connected {
            if let Err(error) = self.client.disconnect(self.timeouts.drain_timeout()).await {
                warn!(connection_id = %self.connection_id, %error, "teardown disconnect failed");
            }
            let _ = advance(
                &self.state_tx,
                &self.connection_id,
                LifecycleEvent::CloseRequested,
            );
            let _ = advance(
                &self.state_tx,
                &self.connection_id,
                LifecycleEvent::CloseCompleted,
            );
        }
        info!(connection_id = %self.connection_id, "connection task stopped");
    }

    async fn handle_open(&mut self, correlation_id: Uuid, reply: oneshot::Sender<Acknowledgement>) {
        if let Err(invalid) = advance(
            &self.state_tx,
            &self.connection_id,
            LifecycleEvent::OpenRequested,
        ) {
            let _ = reply.send(Acknowledgement::failure(
                self.connection_id.clone(),
                correlation_id,
                invalid.from,
                ConnectivityError::configuration(invalid.to_string()),
            ));
            return;
        }

        let deadline = self.timeouts.connection_timeout();
        // the connect future borrows the client, so the close path that needs
        // the client again runs only after this block drops it
        let deferred_close = {
            let connect = tokio::time::timeout(deadline, self.client.connect());
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => {
                        let ack = match result {
                            Ok(Ok(())) => {
                                let next = advance(
                                    &self.state_tx,
                                    &self.connection_id,
                                    LifecycleEvent::ConnectSucceeded,
                                )
                                .unwrap_or(ClientState::Connected);
                                info!(connection_id = %self.connection_id, "connection established");
                                Acknowledgement::success(
                                    self.connection_id.clone(),
                                    correlation_id,
                                    next,
                                )
                            }
                            Ok(Err(error)) => {
                                let next = advance(
                                    &self.state_tx,
                                    &self.connection_id,
                                    LifecycleEvent::ConnectFailed,
                                )
                                .unwrap_or(ClientState::Failed);
                                warn!(connection_id = %self.connection_id, %error, "connect failed");
                                Acknowledgement::failure(
                                    self.connection_id.clone(),
                                    correlation_id,
                                    next,
                                    error,
                                )
                            }
                            Err(_) => {
                                let next = advance(
                                    &self.state_tx,
                                    &self.connection_id,
                                    LifecycleEvent::ConnectFailed,
                                )
                                .unwrap_or(ClientState::Failed);
                                warn!(connection_id = %self.connection_id, "connect timed out");
                                Acknowledgement::failure(
                                    self.connection_id.clone(),
                                    correlation_id,
                                    next,
                                    ConnectivityError::timeout("connect", deadline),
                                )
                            }
                        };
                        let _ = reply.send(ack);
                        break None;
                    }
                    command = self.commands.recv() => match command {
                        Some(ConnectionCommand::Close { correlation_id: close_id, reply: close_reply }) => {
                            let next = advance(
                                &self.state_tx,
                                &self.connection_id,
                                LifecycleEvent::CloseRequested,
                            )
                            .unwrap_or(ClientState::Disconnecting);
                            let _ = reply.send(Acknowledgement::failure(
                                self.connection_id.clone(),
                                correlation_id,
                                next,
                                ConnectivityError::transport("connect cancelled by close"),
                            ));
                            break Some((close_id, close_reply));
                        }
                        Some(ConnectionCommand::Open { correlation_id: dup_id, reply: dup_reply }) => {
                            let _ = dup_reply.send(Acknowledgement::failure(
                                self.connection_id.clone(),
                                dup_id,
                                ClientState::Connecting,
                                ConnectivityError::configuration("open already in progress"),
                            ));
                        }
                        None => {
                            // handle dropped mid-connect; let the attempt resolve
                            match connect.await {
                                Ok(Ok(())) => {
                                    let _ = advance(
                                        &self.state_tx,
                                        &self.connection_id,
                                        LifecycleEvent::ConnectSucceeded,
                                    );
                                }
                                _ => {
                                    let _ = advance(
                                        &self.state_tx,
                                        &self.connection_id,
                                        LifecycleEvent::ConnectFailed,
                                    );
                                }
                            }
                            break None;
                        }
                    }
                }
            }
        };

        if let Some((close_id, close_reply)) = deferred_close {
            self.finish_close(close_id, close_reply).await;
        }
    }

    async fn handle_close(
        &mut self,
        correlation_id: Uuid,
        reply: oneshot::Sender<Acknowledgement>,
    ) {
        if self.state() == ClientState::Closed {
            let _ = reply.send(Acknowledgement::success(
                self.connection_id.clone(),
                correlation_id,
                ClientState::Closed,
            ));
            return;
        }
        let _ = advance(
            &self.state_tx,
            &self.connection_id,
            LifecycleEvent::CloseRequested,
        );
        self.finish_close(correlation_id, reply).await;
    }

    /// Drain and tear down; the state always settles at closed because the
    /// transport is gone either way.
    async fn finish_close(
        &mut self,
        correlation_id: Uuid,
        reply: oneshot::Sender<Acknowledgement>,
    ) {
        let drain = self.timeouts.drain_timeout();
        let deadline = self.timeouts.connection_timeout();
        let result = tokio::time::timeout(deadline, self.client.disconnect(drain)).await;

        let leftover = self.client.unacknowledged_publishes();
        if !leftover.is_empty() {
            warn!(
                connection_id = %self.connection_id,
                count = leftover.len(),
                "publishes still unacknowledged after drain"
            );
        }

        let state = advance(
            &self.state_tx,
            &self.connection_id,
            LifecycleEvent::CloseCompleted,
        )
        .unwrap_or(ClientState::Closed);

        let ack = match result {
            Ok(Ok(())) => {
                info!(connection_id = %self.connection_id, "connection closed");
                Acknowledgement::success(self.connection_id.clone(), correlation_id, state)
            }
            Ok(Err(error)) => {
                warn!(connection_id = %self.connection_id, %error, "disconnect reported an error");
                Acknowledgement::failure(self.connection_id.clone(), correlation_id, state, error)
            }
            Err(_) => Acknowledgement::failure(
                self.connection_id.clone(),
                correlation_id,
                state,
                ConnectivityError::timeout("disconnect", deadline),
            ),
        };
        let _ = reply.send(ack);
    }
}

fn advance(
    state_tx: &watch::Sender<ClientState>,
    connection_id: &ConnectionId,
    event: LifecycleEvent,
) -> Result<ClientState, state::InvalidTransition> {
    let current = *state_tx.borrow();
    let next = state::apply(current, event)?;
    if next != current {
        debug!(connection_id = %connection_id, from = %current, to = %next, "state transition");
        let _ = state_tx.send(next);
    }
    Ok(next)
}
