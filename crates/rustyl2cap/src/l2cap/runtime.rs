//! Tokio front end for the engine
//!
//! [`L2capManager`] is synchronous and single-owner. The runtime moves it
//! into one task that drains a command queue; [`L2capHandle`] posts
//! commands from anywhere and awaits the result over a oneshot. Timer
//! expiries are posted onto the same queue, so the manager is never
//! entered concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::core::L2capManager;
use super::link::{LinkLayer, TimerId, TimerScheduler};
use super::psm::PSM;
use super::service::{ConnectionParameterHandler, EchoHandler, FixedChannelHandler, Service};
use super::settings::EngineSettings;
use super::types::*;

type Reply<T> = oneshot::Sender<L2capResult<T>>;

enum Command {
    Register {
        le: bool,
        psm: PSM,
        service: Box<dyn Service>,
        policy: ConnectionPolicy,
        reply: Reply<()>,
    },
    Deregister {
        le: bool,
        psm: PSM,
        reply: Reply<()>,
    },
    SetEchoHandler(Box<dyn EchoHandler>),
    SetConnectionParameterHandler(Box<dyn ConnectionParameterHandler>),
    SetFixedChannelHandler(Box<dyn FixedChannelHandler>),
    Open {
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<ChannelConfig>,
        reply: Reply<u16>,
    },
    OpenLe {
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<LeChannelConfig>,
        reply: Reply<u16>,
    },
    Send {
        lcid: u16,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Close {
        lcid: u16,
        reply: Reply<()>,
    },
    ConnectResponse {
        lcid: u16,
        identifier: u8,
        result: u16,
        status: u16,
        reply: Reply<()>,
    },
    Configure {
        lcid: u16,
        config: ChannelConfig,
        reply: Reply<()>,
    },
    ConfigResponse {
        lcid: u16,
        identifier: u8,
        result: ConfigResult,
        options: ConfigOptions,
        reply: Reply<()>,
    },
    DisconnectResponse {
        lcid: u16,
        identifier: u8,
        reply: Reply<()>,
    },
    LeConnectResponse {
        lcid: u16,
        identifier: u8,
        result: u16,
        reply: Reply<()>,
    },
    SetLocalBusy {
        lcid: u16,
        busy: bool,
        reply: Reply<()>,
    },
    Echo {
        handle: u16,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    SendFixed {
        handle: u16,
        cid: u16,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    ParameterUpdate {
        handle: u16,
        params: ConnectionParameterUpdate,
        reply: Reply<()>,
    },
    ParameterUpdateResponse {
        handle: u16,
        identifier: u8,
        accepted: bool,
        reply: Reply<()>,
    },
    ChannelState {
        lcid: u16,
        reply: Reply<Option<ChannelState>>,
    },
    LinkUp {
        address: BdAddr,
        handle: u16,
        kind: ConnectionType,
        role: LeRole,
        status: u8,
    },
    LinkDown {
        handle: u16,
        status: u8,
        reason: u8,
    },
    Receive {
        handle: u16,
        data: Vec<u8>,
    },
    Timer {
        id: TimerId,
        generation: u64,
    },
}

struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

type ArmedTimers = Arc<Mutex<HashMap<TimerId, ArmedTimer>>>;

/// [`TimerScheduler`] backed by `tokio::time`
///
/// Each armed timer is a sleeping task that posts its id and generation
/// back to the command queue. Re-arming or cancelling bumps past the
/// posted generation, so an expiry already in the queue is ignored.
struct TokioTimers {
    commands: mpsc::WeakSender<Command>,
    armed: ArmedTimers,
    next_generation: u64,
}

impl TimerScheduler for TokioTimers {
    fn schedule(&mut self, id: TimerId, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timer { id, generation }).await;
            }
        });

        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = armed.insert(id, ArmedTimer { generation, task }) {
            previous.task.abort();
        }
    }

    fn cancel(&mut self, id: TimerId) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = armed.remove(&id) {
            previous.task.abort();
        }
    }
}

/// Task owning the engine
pub struct L2capRuntime {
    manager: L2capManager,
    commands: mpsc::Receiver<Command>,
    armed: ArmedTimers,
}

impl L2capRuntime {
    /// Spawn the engine onto the current tokio runtime
    ///
    /// The task ends once every [`L2capHandle`] has been dropped.
    pub fn spawn(settings: EngineSettings, link: Box<dyn LinkLayer>) -> (L2capHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let armed = ArmedTimers::default();
        let timers = TokioTimers {
            commands: tx.downgrade(),
            armed: Arc::clone(&armed),
            next_generation: 0,
        };

        let runtime = Self {
            manager: L2capManager::new(settings, link, Box::new(timers)),
            commands: rx,
            armed,
        };
        let task = tokio::spawn(runtime.run());
        (L2capHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        info!("L2CAP runtime started");
        while let Some(command) = self.commands.recv().await {
            self.execute(command);
        }

        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in armed.drain() {
            timer.task.abort();
        }
        info!("L2CAP runtime stopped");
    }

    fn execute(&mut self, command: Command) {
        let manager = &mut self.manager;
        match command {
            Command::Register {
                le,
                psm,
                service,
                policy,
                reply,
            } => {
                let result = if le {
                    manager.register_le(psm, service, policy)
                } else {
                    manager.register(psm, service, policy)
                };
                let _ = reply.send(result);
            }
            Command::Deregister { le, psm, reply } => {
                let result = if le {
                    manager.deregister_le(psm)
                } else {
                    manager.deregister(psm)
                };
                let _ = reply.send(result);
            }
            Command::SetEchoHandler(handler) => manager.set_echo_handler(handler),
            Command::SetConnectionParameterHandler(handler) => manager.set_connection_parameter_handler(handler),
            Command::SetFixedChannelHandler(handler) => manager.set_fixed_channel_handler(handler),
            Command::Open {
                address,
                local_psm,
                remote_psm,
                config,
                reply,
            } => {
                let _ = reply.send(manager.open(address, local_psm, remote_psm, config));
            }
            Command::OpenLe {
                address,
                local_psm,
                remote_psm,
                config,
                reply,
            } => {
                let _ = reply.send(manager.open_le(address, local_psm, remote_psm, config));
            }
            Command::Send { lcid, data, reply } => {
                let _ = reply.send(manager.send(lcid, &data));
            }
            Command::Close { lcid, reply } => {
                let _ = reply.send(manager.close(lcid));
            }
            Command::ConnectResponse {
                lcid,
                identifier,
                result,
                status,
                reply,
            } => {
                let _ = reply.send(manager.connect_response(lcid, identifier, result, status));
            }
            Command::Configure { lcid, config, reply } => {
                let _ = reply.send(manager.configure(lcid, config));
            }
            Command::ConfigResponse {
                lcid,
                identifier,
                result,
                options,
                reply,
            } => {
                let _ = reply.send(manager.config_response(lcid, identifier, result, options));
            }
            Command::DisconnectResponse {
                lcid,
                identifier,
                reply,
            } => {
                let _ = reply.send(manager.disconnect_response(lcid, identifier));
            }
            Command::LeConnectResponse {
                lcid,
                identifier,
                result,
                reply,
            } => {
                let _ = reply.send(manager.le_connect_response(lcid, identifier, result));
            }
            Command::SetLocalBusy { lcid, busy, reply } => {
                let _ = reply.send(manager.set_local_busy(lcid, busy));
            }
            Command::Echo { handle, data, reply } => {
                let _ = reply.send(manager.echo(handle, &data));
            }
            Command::SendFixed {
                handle,
                cid,
                data,
                reply,
            } => {
                let _ = reply.send(manager.send_fixed(handle, cid, &data));
            }
            Command::ParameterUpdate { handle, params, reply } => {
                let _ = reply.send(manager.connection_parameter_update(handle, params));
            }
            Command::ParameterUpdateResponse {
                handle,
                identifier,
                accepted,
                reply,
            } => {
                let _ = reply.send(manager.connection_parameter_update_response(handle, identifier, accepted));
            }
            Command::ChannelState { lcid, reply } => {
                let _ = reply.send(Ok(manager.channel_state(lcid)));
            }
            Command::LinkUp {
                address,
                handle,
                kind,
                role,
                status,
            } => manager.link_up(address, handle, kind, role, status),
            Command::LinkDown { handle, status, reason } => manager.link_down(handle, status, reason),
            Command::Receive { handle, data } => manager.receive(handle, &data),
            Command::Timer { id, generation } => {
                let current = {
                    let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
                    let current = armed.get(&id).is_some_and(|timer| timer.generation == generation);
                    if current {
                        armed.remove(&id);
                    }
                    current
                };
                if current {
                    manager.handle_timeout(id);
                } else {
                    debug!("Discarding stale expiry of {:?}", id);
                }
            }
        }
    }
}

/// Cloneable async front end to a running [`L2capRuntime`]
#[derive(Clone)]
pub struct L2capHandle {
    commands: mpsc::Sender<Command>,
}

impl L2capHandle {
    async fn post(&self, command: Command) -> L2capResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| L2capError::RuntimeShutdown)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> L2capResult<T> {
        let (tx, rx) = oneshot::channel();
        self.post(build(tx)).await?;
        rx.await.map_err(|_| L2capError::RuntimeShutdown)?
    }

    pub async fn register(&self, psm: PSM, service: Box<dyn Service>, policy: ConnectionPolicy) -> L2capResult<()> {
        self.call(|reply| Command::Register {
            le: false,
            psm,
            service,
            policy,
            reply,
        })
        .await
    }

    pub async fn register_le(&self, psm: PSM, service: Box<dyn Service>, policy: ConnectionPolicy) -> L2capResult<()> {
        self.call(|reply| Command::Register {
            le: true,
            psm,
            service,
            policy,
            reply,
        })
        .await
    }

    pub async fn deregister(&self, psm: PSM) -> L2capResult<()> {
        self.call(|reply| Command::Deregister { le: false, psm, reply }).await
    }

    pub async fn deregister_le(&self, psm: PSM) -> L2capResult<()> {
        self.call(|reply| Command::Deregister { le: true, psm, reply }).await
    }

    pub async fn set_echo_handler(&self, handler: Box<dyn EchoHandler>) -> L2capResult<()> {
        self.post(Command::SetEchoHandler(handler)).await
    }

    pub async fn set_connection_parameter_handler(
        &self,
        handler: Box<dyn ConnectionParameterHandler>,
    ) -> L2capResult<()> {
        self.post(Command::SetConnectionParameterHandler(handler)).await
    }

    pub async fn set_fixed_channel_handler(&self, handler: Box<dyn FixedChannelHandler>) -> L2capResult<()> {
        self.post(Command::SetFixedChannelHandler(handler)).await
    }

    pub async fn open(
        &self,
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<ChannelConfig>,
    ) -> L2capResult<u16> {
        self.call(|reply| Command::Open {
            address,
            local_psm,
            remote_psm,
            config,
            reply,
        })
        .await
    }

    pub async fn open_le(
        &self,
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<LeChannelConfig>,
    ) -> L2capResult<u16> {
        self.call(|reply| Command::OpenLe {
            address,
            local_psm,
            remote_psm,
            config,
            reply,
        })
        .await
    }

    pub async fn send(&self, lcid: u16, data: Vec<u8>) -> L2capResult<()> {
        self.call(|reply| Command::Send { lcid, data, reply }).await
    }

    pub async fn close(&self, lcid: u16) -> L2capResult<()> {
        self.call(|reply| Command::Close { lcid, reply }).await
    }

    pub async fn connect_response(&self, lcid: u16, identifier: u8, result: u16, status: u16) -> L2capResult<()> {
        self.call(|reply| Command::ConnectResponse {
            lcid,
            identifier,
            result,
            status,
            reply,
        })
        .await
    }

    pub async fn configure(&self, lcid: u16, config: ChannelConfig) -> L2capResult<()> {
        self.call(|reply| Command::Configure { lcid, config, reply }).await
    }

    pub async fn config_response(
        &self,
        lcid: u16,
        identifier: u8,
        result: ConfigResult,
        options: ConfigOptions,
    ) -> L2capResult<()> {
        self.call(|reply| Command::ConfigResponse {
            lcid,
            identifier,
            result,
            options,
            reply,
        })
        .await
    }

    pub async fn disconnect_response(&self, lcid: u16, identifier: u8) -> L2capResult<()> {
        self.call(|reply| Command::DisconnectResponse {
            lcid,
            identifier,
            reply,
        })
        .await
    }

    pub async fn le_connect_response(&self, lcid: u16, identifier: u8, result: u16) -> L2capResult<()> {
        self.call(|reply| Command::LeConnectResponse {
            lcid,
            identifier,
            result,
            reply,
        })
        .await
    }

    pub async fn set_local_busy(&self, lcid: u16, busy: bool) -> L2capResult<()> {
        self.call(|reply| Command::SetLocalBusy { lcid, busy, reply }).await
    }

    pub async fn echo(&self, handle: u16, data: Vec<u8>) -> L2capResult<()> {
        self.call(|reply| Command::Echo { handle, data, reply }).await
    }

    pub async fn send_fixed(&self, handle: u16, cid: u16, data: Vec<u8>) -> L2capResult<()> {
        self.call(|reply| Command::SendFixed {
            handle,
            cid,
            data,
            reply,
        })
        .await
    }

    pub async fn connection_parameter_update(
        &self,
        handle: u16,
        params: ConnectionParameterUpdate,
    ) -> L2capResult<()> {
        self.call(|reply| Command::ParameterUpdate { handle, params, reply }).await
    }

    pub async fn connection_parameter_update_response(
        &self,
        handle: u16,
        identifier: u8,
        accepted: bool,
    ) -> L2capResult<()> {
        self.call(|reply| Command::ParameterUpdateResponse {
            handle,
            identifier,
            accepted,
            reply,
        })
        .await
    }

    pub async fn channel_state(&self, lcid: u16) -> L2capResult<Option<ChannelState>> {
        self.call(|reply| Command::ChannelState { lcid, reply }).await
    }

    /// Link layer event: link creation finished
    pub async fn link_up(
        &self,
        address: BdAddr,
        handle: u16,
        kind: ConnectionType,
        role: LeRole,
        status: u8,
    ) -> L2capResult<()> {
        self.post(Command::LinkUp {
            address,
            handle,
            kind,
            role,
            status,
        })
        .await
    }

    pub async fn link_down(&self, handle: u16, status: u8, reason: u8) -> L2capResult<()> {
        self.post(Command::LinkDown { handle, status, reason }).await
    }

    /// Link layer event: one complete frame arrived
    pub async fn receive(&self, handle: u16, data: Vec<u8>) -> L2capResult<()> {
        self.post(Command::Receive { handle, data }).await
    }
}
