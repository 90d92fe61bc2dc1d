//! L2CAP Core Manager implementation
//!
//! [`L2capManager`] is the protocol engine. It handles:
//! - Service registration and channel setup and teardown
//! - Routing of received frames to signaling or channel data paths
//! - Pending signaling requests and their timeouts
//! - Link lifecycle
//!
//! The manager is driven entirely from outside: API calls, frames from the
//! [`LinkLayer`] and timer expiries. It never blocks and holds no locks;
//! `runtime` serializes access from async code. Service callbacks are
//! queued while a call is processed and delivered before it returns.

use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};

use super::channel::{L2capChannel, ModeState};
use super::connection::{Connection, InfoState, PendingRequest};
use super::constants::*;
use super::credit::CreditAction;
use super::erfc::ErfcAction;
use super::link::{LinkLayer, TimerId, TimerScheduler};
use super::packet::{L2capHeader, L2capPacket};
use super::psm::PSM;
use super::registry::{ConnId, Registry};
use super::service::*;
use super::settings::EngineSettings;
use super::signaling::SignalingMessage;
use super::types::*;

pub(crate) struct Registration {
    pub(crate) service: Box<dyn Service>,
    pub(crate) policy: ConnectionPolicy,
    pub(crate) config: ChannelConfig,
}

pub(crate) struct LeRegistration {
    pub(crate) service: Box<dyn Service>,
    pub(crate) policy: ConnectionPolicy,
    pub(crate) config: LeChannelConfig,
}

/// What happens to the link when its last channel goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Arm the linger timer
    Linger,
    /// Disconnect the link now
    Immediate,
}

/// Protocol engine for one local adapter
pub struct L2capManager {
    pub(crate) settings: EngineSettings,
    pub(crate) registry: Registry,
    pub(crate) services: HashMap<u16, Registration>,
    pub(crate) le_services: HashMap<u16, LeRegistration>,
    pub(crate) echo_handler: Option<Box<dyn EchoHandler>>,
    pub(crate) conn_param_handler: Option<Box<dyn ConnectionParameterHandler>>,
    pub(crate) fixed_handler: Option<Box<dyn FixedChannelHandler>>,
    link: Box<dyn LinkLayer>,
    timers: Box<dyn TimerScheduler>,
    events: VecDeque<(ServiceKey, u16, ServiceEvent)>,
}

impl L2capManager {
    pub fn new(settings: EngineSettings, link: Box<dyn LinkLayer>, timers: Box<dyn TimerScheduler>) -> Self {
        Self {
            settings,
            registry: Registry::new(),
            services: HashMap::new(),
            le_services: HashMap::new(),
            echo_handler: None,
            conn_param_handler: None,
            fixed_handler: None,
            link,
            timers,
            events: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register a classic service using the engine's default configuration
    pub fn register(&mut self, psm: PSM, service: Box<dyn Service>, policy: ConnectionPolicy) -> L2capResult<()> {
        let config = self.settings.default_channel_config();
        self.register_with_config(psm, service, policy, config)
    }

    /// Register a classic service whose channels use `config`
    pub fn register_with_config(
        &mut self,
        psm: PSM,
        service: Box<dyn Service>,
        policy: ConnectionPolicy,
        config: ChannelConfig,
    ) -> L2capResult<()> {
        if !psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM: {}", psm)));
        }
        self.validate_config(&config)?;
        if self.services.contains_key(&psm.value()) {
            return Err(L2capError::PsmAlreadyRegistered(psm.value()));
        }

        info!("Registered service on {}", psm);
        self.services.insert(psm.value(), Registration { service, policy, config });
        Ok(())
    }

    pub fn deregister(&mut self, psm: PSM) -> L2capResult<()> {
        self.services
            .remove(&psm.value())
            .map(|_| info!("Deregistered service on {}", psm))
            .ok_or(L2capError::PsmNotRegistered(psm.value()))
    }

    /// Register an LE credit based service using the engine's defaults
    pub fn register_le(&mut self, psm: PSM, service: Box<dyn Service>, policy: ConnectionPolicy) -> L2capResult<()> {
        let config = self.settings.default_le_config();
        self.register_le_with_config(psm, service, policy, config)
    }

    pub fn register_le_with_config(
        &mut self,
        psm: PSM,
        service: Box<dyn Service>,
        policy: ConnectionPolicy,
        config: LeChannelConfig,
    ) -> L2capResult<()> {
        if !psm.is_valid_le() {
            return Err(L2capError::InvalidParameter(format!("Invalid LE PSM: {}", psm)));
        }
        if !config.is_valid() {
            return Err(L2capError::InvalidParameter(format!(
                "LE MTU {} / MPS {} below minimum",
                config.mtu, config.mps
            )));
        }
        if self.le_services.contains_key(&psm.value()) {
            return Err(L2capError::PsmAlreadyRegistered(psm.value()));
        }

        info!("Registered LE service on {}", psm);
        self.le_services.insert(psm.value(), LeRegistration { service, policy, config });
        Ok(())
    }

    pub fn deregister_le(&mut self, psm: PSM) -> L2capResult<()> {
        self.le_services
            .remove(&psm.value())
            .map(|_| info!("Deregistered LE service on {}", psm))
            .ok_or(L2capError::PsmNotRegistered(psm.value()))
    }

    /// Unregistered dynamic classic PSM
    pub fn allocate_psm(&mut self) -> Option<PSM> {
        let services = &self.services;
        self.registry.allocate_psm(false, |psm| services.contains_key(&psm))
    }

    /// Unregistered dynamic LE PSM
    pub fn allocate_le_psm(&mut self) -> Option<PSM> {
        let services = &self.le_services;
        self.registry.allocate_psm(true, |psm| services.contains_key(&psm))
    }

    pub fn set_echo_handler(&mut self, handler: Box<dyn EchoHandler>) {
        self.echo_handler = Some(handler);
    }

    pub fn set_connection_parameter_handler(&mut self, handler: Box<dyn ConnectionParameterHandler>) {
        self.conn_param_handler = Some(handler);
    }

    pub fn set_fixed_channel_handler(&mut self, handler: Box<dyn FixedChannelHandler>) {
        self.fixed_handler = Some(handler);
    }

    pub fn channel(&self, lcid: u16) -> Option<&L2capChannel> {
        self.registry.channel(lcid)
    }

    pub fn channel_state(&self, lcid: u16) -> Option<ChannelState> {
        self.registry.channel(lcid).map(L2capChannel::state)
    }

    pub fn connection(&self, handle: u16) -> Option<&Connection> {
        self.registry
            .find_by_handle(handle)
            .and_then(|id| self.registry.connection(id))
    }

    fn validate_config(&self, config: &ChannelConfig) -> L2capResult<()> {
        if config.mtu < self.settings.min_mtu {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} below minimum {}",
                config.mtu, self.settings.min_mtu
            )));
        }
        if !config.rfc.mode.is_supported() {
            return Err(L2capError::NotSupported);
        }
        Ok(())
    }

    pub(crate) fn policy(&self, key: ServiceKey) -> ConnectionPolicy {
        match key {
            ServiceKey::Classic(psm) => self.services.get(&psm).map(|r| r.policy),
            ServiceKey::Le(psm) => self.le_services.get(&psm).map(|r| r.policy),
        }
        .unwrap_or_default()
    }

    /// Open a classic channel to `remote_psm` on `address`
    ///
    /// Creates the link if needed. The returned local CID identifies the
    /// channel in every later call and callback.
    pub fn open(
        &mut self,
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<ChannelConfig>,
    ) -> L2capResult<u16> {
        if !remote_psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM: {}", remote_psm)));
        }
        let registration = self
            .services
            .get(&local_psm.value())
            .ok_or(L2capError::PsmNotRegistered(local_psm.value()))?;
        let config = config.unwrap_or(registration.config);
        self.validate_config(&config)?;

        let (lpsm, rpsm) = (local_psm.value(), remote_psm.value());
        let lcid = self.add_channel(address, ConnectionType::Classic, |lcid| {
            L2capChannel::new_classic(lcid, lpsm, rpsm, config)
        })?;
        self.flush_events();
        Ok(lcid)
    }

    /// Open an LE credit based channel to `remote_psm` on `address`
    pub fn open_le(
        &mut self,
        address: BdAddr,
        local_psm: PSM,
        remote_psm: PSM,
        config: Option<LeChannelConfig>,
    ) -> L2capResult<u16> {
        if !remote_psm.is_valid_le() {
            return Err(L2capError::InvalidParameter(format!("Invalid LE PSM: {}", remote_psm)));
        }
        let registration = self
            .le_services
            .get(&local_psm.value())
            .ok_or(L2capError::PsmNotRegistered(local_psm.value()))?;
        let config = config.unwrap_or(registration.config);
        if !config.is_valid() {
            return Err(L2capError::InvalidParameter(format!(
                "LE MTU {} / MPS {} below minimum",
                config.mtu, config.mps
            )));
        }

        let (lpsm, rpsm) = (local_psm.value(), remote_psm.value());
        let lcid = self.add_channel(address, ConnectionType::LE, |lcid| {
            L2capChannel::new_le(lcid, lpsm, rpsm, config)
        })?;
        self.flush_events();
        Ok(lcid)
    }

    fn add_channel(
        &mut self,
        address: BdAddr,
        kind: ConnectionType,
        build: impl FnOnce(u16) -> L2capChannel,
    ) -> L2capResult<u16> {
        let (conn, created) = match self.registry.find_by_address(address, kind) {
            Some(conn) => (conn, false),
            None => (self.registry.create_connection(address, kind), true),
        };
        let state = self
            .registry
            .connection(conn)
            .map(Connection::state)
            .ok_or(L2capError::NotConnected)?;
        if state == ConnectionState::Disconnecting {
            return Err(L2capError::NotConnected);
        }

        let Some(lcid) = self.registry.new_channel(conn, build) else {
            if created {
                self.registry.remove_connection(conn);
            }
            return Err(L2capError::ResourceLimitReached);
        };
        self.cancel_linger(conn);
        debug!("Created channel 0x{:04X} to {}", lcid, address);

        match state {
            ConnectionState::Idle => {
                if let Err(e) = self.link.connect(address, kind) {
                    if let Some(connection) = self.registry.connection_mut(conn) {
                        connection.channels.remove(&lcid);
                    }
                    if created {
                        self.registry.remove_connection(conn);
                    }
                    return Err(e.into());
                }
                if let Some(connection) = self.registry.connection_mut(conn) {
                    connection.state = ConnectionState::Connecting;
                }
            }
            ConnectionState::Connected => self.start_channel(conn, lcid),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
        Ok(lcid)
    }

    /// Move an IDLE channel forward on a link that is up
    fn start_channel(&mut self, conn: ConnId, lcid: u16) {
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        if connection.is_le() {
            self.send_le_connection_request(conn, lcid);
            return;
        }
        match connection.info_state {
            InfoState::None => self.send_info_request(conn, L2CAP_INFO_EXTENDED_FEATURES),
            InfoState::Processing => {}
            InfoState::Done => self.send_connection_request(conn, lcid),
        }
    }

    /// Send an SDU on a connected channel
    pub fn send(&mut self, lcid: u16, data: &[u8]) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let connection = self
            .registry
            .connection_mut(conn)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let handle = connection.handle;
        let channel = connection
            .channel_mut(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        if channel.state != ChannelState::Connected {
            return Err(L2capError::NotConnected);
        }

        let mtu = channel.tx_mtu();
        if data.len() > mtu as usize {
            return Err(L2capError::MtuExceeded { size: data.len(), mtu });
        }

        match &mut channel.mode {
            ModeState::Basic => {
                let flush = channel.local_config.flush_timeout;
                let bytes = L2capPacket::new(channel.remote_cid, data.to_vec()).to_bytes();
                self.transmit(handle, flush, &bytes);
            }
            ModeState::Erfc(engine) => {
                engine.send_sdu(data);
                self.run_erfc_actions(conn, lcid);
            }
            ModeState::Credit(engine) => {
                engine.send_sdu(data)?;
                self.run_credit_actions(conn, lcid);
            }
        }
        self.flush_events();
        Ok(())
    }

    /// Close a channel in any state
    ///
    /// Unknown channels, and channels already waiting on their
    /// disconnection response, are a parameter error.
    pub fn close(&mut self, lcid: u16) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or_else(|| L2capError::InvalidParameter(format!("Unknown channel 0x{:04X}", lcid)))?;
        let channel = self
            .registry
            .channel(lcid)
            .ok_or_else(|| L2capError::InvalidParameter(format!("Unknown channel 0x{:04X}", lcid)))?;
        let (state, rcid, is_le) = (channel.state, channel.remote_cid, channel.is_le());
        let (connect_id, disconnect_id) = (channel.connect_identifier, channel.disconnect_identifier);
        debug!("Closing channel 0x{:04X} in state {}", lcid, state);

        match state {
            ChannelState::Idle | ChannelState::ConnectOutReq => {
                self.delete_channel(conn, lcid, Teardown::Linger);
            }
            ChannelState::ConnectInReq => {
                let message = if is_le {
                    le_refusal(connect_id, L2CAP_LE_NO_RESOURCES)
                } else {
                    SignalingMessage::ConnectionResponse {
                        identifier: connect_id,
                        destination_cid: 0,
                        source_cid: rcid,
                        result: L2CAP_CONNECTION_NO_RESOURCES,
                        status: L2CAP_STATUS_NO_INFORMATION,
                    }
                };
                self.send_signal(conn, message);
                self.delete_channel(conn, lcid, Teardown::Linger);
            }
            ChannelState::Configuring | ChannelState::Connected => {
                self.local_disconnect(conn, lcid, None);
            }
            ChannelState::DisconnectOutReq => {
                return Err(L2capError::InvalidParameter(format!(
                    "Channel 0x{:04X} is already closing",
                    lcid
                )))
            }
            ChannelState::DisconnectInReq => {
                self.send_signal(
                    conn,
                    SignalingMessage::DisconnectionResponse {
                        identifier: disconnect_id,
                        destination_cid: lcid,
                        source_cid: rcid,
                    },
                );
                self.delete_channel(conn, lcid, Teardown::Linger);
            }
        }
        self.flush_events();
        Ok(())
    }

    /// Answer a disconnection request reported to a manual service
    pub fn disconnect_response(&mut self, lcid: u16, identifier: u8) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let channel = self.registry.channel(lcid).ok_or(L2capError::ChannelNotFound(lcid))?;
        if channel.state != ChannelState::DisconnectInReq {
            return Err(L2capError::InvalidState(channel.state));
        }
        let rcid = channel.remote_cid;

        self.send_signal(
            conn,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid: lcid,
                source_cid: rcid,
            },
        );
        self.delete_channel(conn, lcid, Teardown::Linger);
        self.flush_events();
        Ok(())
    }

    /// Make an ERTM channel report itself busy to the peer
    pub fn set_local_busy(&mut self, lcid: u16, busy: bool) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        match self.registry.channel_mut(lcid).map(|c| &mut c.mode) {
            Some(ModeState::Erfc(engine)) => engine.set_local_busy(busy),
            _ => return Err(L2capError::NotSupported),
        }
        self.run_erfc_actions(conn, lcid);
        self.flush_events();
        Ok(())
    }

    /// Send an echo request on a classic link
    pub fn echo(&mut self, handle: u16, data: &[u8]) -> L2capResult<()> {
        let conn = self.connected_link(handle, ConnectionType::Classic)?;
        let data = data.to_vec();
        self.send_request(conn, None, |identifier| SignalingMessage::EchoRequest { identifier, data });
        Ok(())
    }

    /// Send raw payload on an LE fixed channel (ATT or SMP)
    pub fn send_fixed(&mut self, handle: u16, cid: u16, data: &[u8]) -> L2capResult<()> {
        if cid != L2CAP_ATTRIBUTE_PROTOCOL_CID && cid != L2CAP_SECURITY_MANAGER_CID {
            return Err(L2capError::InvalidParameter(format!("Not a fixed channel: 0x{:04X}", cid)));
        }
        self.connected_link(handle, ConnectionType::LE)?;
        let bytes = L2capPacket::new(cid, data.to_vec()).to_bytes();
        self.transmit(Some(handle), L2CAP_DEFAULT_FLUSH_TIMEOUT, &bytes);
        Ok(())
    }

    pub(crate) fn connected_link(&self, handle: u16, kind: ConnectionType) -> L2capResult<ConnId> {
        let conn = self
            .registry
            .find_by_handle(handle)
            .ok_or(L2capError::ConnectionNotFound(handle))?;
        let connection = self
            .registry
            .connection(conn)
            .ok_or(L2capError::ConnectionNotFound(handle))?;
        if connection.kind != kind {
            return Err(L2capError::NotSupported);
        }
        if connection.state != ConnectionState::Connected {
            return Err(L2capError::NotConnected);
        }
        Ok(conn)
    }

    /// Link to `address` came up, or failed to when `status` is non-zero
    pub fn link_up(&mut self, address: BdAddr, handle: u16, kind: ConnectionType, role: LeRole, status: u8) {
        if status != 0 {
            warn!("Link to {} failed with status 0x{:02X}", address, status);
            if let Some(conn) = self.registry.find_by_address(address, kind) {
                if let Some(connection) = self.registry.remove_connection(conn) {
                    self.release_connection(connection, |_, _| DisconnectReason::ConnectFailed(status));
                }
            }
            self.flush_events();
            return;
        }

        info!("Link up: {} handle 0x{:04X} ({:?})", address, handle, kind);
        let conn = self
            .registry
            .find_by_address(address, kind)
            .unwrap_or_else(|| self.registry.create_connection(address, kind));
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let initiated = connection.state == ConnectionState::Connecting;
        connection.handle = Some(handle);
        connection.role = role;
        connection.state = ConnectionState::Connected;

        let waiting: Vec<u16> = connection
            .channels
            .values()
            .filter(|c| c.state == ChannelState::Idle)
            .map(L2capChannel::local_cid)
            .collect();

        if initiated && connection.channels.is_empty() {
            // Every channel was closed while the link was being created
            self.arm_linger(conn);
        } else if kind == ConnectionType::Classic {
            if !waiting.is_empty() {
                self.send_info_request(conn, L2CAP_INFO_EXTENDED_FEATURES);
            }
        } else {
            for lcid in waiting {
                self.send_le_connection_request(conn, lcid);
            }
        }
        self.flush_events();
    }

    /// Link with `handle` went down
    pub fn link_down(&mut self, handle: u16, status: u8, reason: u8) {
        let Some(conn) = self.registry.find_by_handle(handle) else {
            debug!("Link down for unknown handle 0x{:04X}", handle);
            return;
        };
        info!(
            "Link down: handle 0x{:04X} status 0x{:02X} reason 0x{:02X}",
            handle, status, reason
        );
        if let Some(connection) = self.registry.remove_connection(conn) {
            self.release_connection(connection, |connection, channel| {
                if connection.info_state == InfoState::Done && channel.state == ChannelState::Idle {
                    DisconnectReason::StateCollision
                } else {
                    DisconnectReason::LinkLoss(reason)
                }
            });
        }
        self.flush_events();
    }

    /// Cancel every timer of a removed connection and report its channels
    fn release_connection(
        &mut self,
        connection: Connection,
        reason: impl Fn(&Connection, &L2capChannel) -> DisconnectReason,
    ) {
        if let Some(handle) = connection.handle {
            for request in connection.pending() {
                self.timers.cancel(TimerId::Response {
                    handle,
                    identifier: request.identifier,
                });
            }
            self.timers.cancel(TimerId::Linger { handle });
        }

        for channel in connection.channels.values() {
            self.cancel_channel_timers(channel.local_cid);
            let reason = reason(&connection, channel);
            info!("Channel 0x{:04X} destroyed: {}", channel.local_cid, reason);
            if !channel.abnormal_reported {
                self.events.push_back((
                    channel.service_key(),
                    channel.local_cid,
                    ServiceEvent::DisconnectAbnormal(reason),
                ));
            }
        }
    }

    /// Frame received on link `handle`, starting at the basic header
    pub fn receive(&mut self, handle: u16, data: &[u8]) {
        trace!("RX handle 0x{:04X}: {}", handle, hex::encode(data));
        self.process_frame(handle, data);
        self.flush_events();
    }

    fn process_frame(&mut self, handle: u16, data: &[u8]) {
        let Some(conn) = self.registry.find_by_handle(handle) else {
            warn!("Frame for unknown handle 0x{:04X}", handle);
            return;
        };
        let Some(header) = L2capHeader::parse(data) else {
            warn!("Frame of {} bytes too short for basic header", data.len());
            return;
        };
        let payload = &data[L2CAP_BASIC_HEADER_SIZE..];
        if payload.len() != header.length as usize {
            warn!(
                "Basic header declares {} bytes, frame carries {}",
                header.length,
                payload.len()
            );
            return;
        }
        let is_le = self
            .registry
            .connection(conn)
            .is_some_and(Connection::is_le);

        match header.channel_id {
            L2CAP_SIGNALING_CID if !is_le => self.handle_classic_signaling(conn, payload),
            L2CAP_LE_SIGNALING_CID if is_le => self.handle_le_signaling(conn, payload),
            cid @ (L2CAP_ATTRIBUTE_PROTOCOL_CID | L2CAP_SECURITY_MANAGER_CID) if is_le => {
                match self.fixed_handler.as_mut() {
                    Some(handler) => handler.on_data(handle, cid, payload),
                    None => debug!("No handler for fixed channel 0x{:04X}", cid),
                }
            }
            cid if cid >= L2CAP_DYNAMIC_CID_MIN => self.handle_channel_data(conn, cid, data),
            cid => debug!("Dropping frame on unsupported channel 0x{:04X}", cid),
        }
    }

    fn handle_channel_data(&mut self, conn: ConnId, lcid: u16, frame: &[u8]) {
        let Some(channel) = self
            .registry
            .connection_mut(conn)
            .and_then(|c| c.channel_mut(lcid))
        else {
            debug!("Data for unknown channel 0x{:04X}", lcid);
            return;
        };
        if channel.state != ChannelState::Connected {
            debug!("Dropping data for channel 0x{:04X} in state {}", lcid, channel.state);
            return;
        }

        let key = channel.service_key();
        let payload = &frame[L2CAP_BASIC_HEADER_SIZE..];
        match &mut channel.mode {
            ModeState::Basic => {
                if payload.len() > channel.local_config.mtu as usize {
                    warn!(
                        "SDU of {} bytes exceeds MTU {} on channel 0x{:04X}",
                        payload.len(),
                        channel.local_config.mtu,
                        lcid
                    );
                    return;
                }
                self.events.push_back((key, lcid, ServiceEvent::Data(payload.to_vec())));
            }
            ModeState::Erfc(engine) => {
                engine.receive(frame);
                self.run_erfc_actions(conn, lcid);
            }
            ModeState::Credit(engine) => {
                engine.receive(payload);
                self.run_credit_actions(conn, lcid);
            }
        }
    }

    /// Timer `id` expired
    pub fn handle_timeout(&mut self, id: TimerId) {
        trace!("Timer expired: {:?}", id);
        match id {
            TimerId::Response { handle, identifier } => self.response_timeout(handle, identifier),
            TimerId::Retransmission { lcid } | TimerId::Monitor { lcid } => {
                let Some(conn) = self.registry.find_channel(lcid) else {
                    return;
                };
                match self.registry.channel_mut(lcid).map(|c| &mut c.mode) {
                    Some(ModeState::Erfc(engine)) => {
                        if matches!(id, TimerId::Retransmission { .. }) {
                            engine.handle_retransmission_timeout();
                        } else {
                            engine.handle_monitor_timeout();
                        }
                    }
                    _ => return,
                }
                self.run_erfc_actions(conn, lcid);
            }
            TimerId::Linger { handle } => self.linger_timeout(handle),
        }
        self.flush_events();
    }

    fn response_timeout(&mut self, handle: u16, identifier: u8) {
        let Some(conn) = self.registry.find_by_handle(handle) else {
            return;
        };
        let Some(request) = self
            .registry
            .connection_mut(conn)
            .and_then(|c| c.take_pending(identifier))
        else {
            debug!("Stale response timer for identifier {}", identifier);
            return;
        };
        warn!(
            "Signaling request 0x{:02X} (id {}) on handle 0x{:04X} timed out",
            request.code, identifier, handle
        );

        match request.lcid {
            Some(lcid) => {
                self.report_abnormal(lcid, DisconnectReason::Timeout);
                self.delete_channel(conn, lcid, Teardown::Immediate);
            }
            None if request.code == L2CAP_INFORMATION_REQUEST => self.disconnect_link(conn),
            None => debug!("Connection-scoped request 0x{:02X} abandoned", request.code),
        }
    }

    fn linger_timeout(&mut self, handle: u16) {
        let Some(conn) = self.registry.find_by_handle(handle) else {
            return;
        };
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        if !connection.linger_armed {
            return;
        }
        connection.linger_armed = false;
        if connection.channels.is_empty() {
            debug!("Idle link 0x{:04X} lingered out", handle);
            self.disconnect_link(conn);
        }
    }

    fn arm_linger(&mut self, conn: ConnId) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        if let Some(handle) = connection.handle {
            connection.linger_armed = true;
            self.timers
                .schedule(TimerId::Linger { handle }, self.settings.linger_timeout);
        }
    }

    pub(crate) fn cancel_linger(&mut self, conn: ConnId) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        if !connection.linger_armed {
            return;
        }
        connection.linger_armed = false;
        if let Some(handle) = connection.handle {
            self.timers.cancel(TimerId::Linger { handle });
        }
    }

    pub(crate) fn disconnect_link(&mut self, conn: ConnId) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let Some(handle) = connection.handle else {
            return;
        };
        if connection.state != ConnectionState::Connected {
            return;
        }
        connection.state = ConnectionState::Disconnecting;
        connection.linger_armed = false;
        self.timers.cancel(TimerId::Linger { handle });

        info!("Disconnecting link 0x{:04X}", handle);
        if let Err(e) = self.link.disconnect(handle, HCI_REMOTE_USER_TERMINATED) {
            error!("Link disconnect of 0x{:04X} failed: {}", handle, e);
        }
    }

    fn cancel_channel_timers(&mut self, lcid: u16) {
        self.timers.cancel(TimerId::Retransmission { lcid });
        self.timers.cancel(TimerId::Monitor { lcid });
    }

    /// Remove a channel, its timers and its pending requests
    pub(crate) fn delete_channel(&mut self, conn: ConnId, lcid: u16, teardown: Teardown) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        if connection.channels.remove(&lcid).is_none() {
            return;
        }
        let requests = connection.take_pending_for(lcid);
        let (handle, state, empty) = (connection.handle, connection.state, connection.channels.is_empty());
        info!("Channel 0x{:04X} destroyed", lcid);

        self.cancel_channel_timers(lcid);
        if let Some(handle) = handle {
            for request in requests {
                self.timers.cancel(TimerId::Response {
                    handle,
                    identifier: request.identifier,
                });
            }
        }
        if !empty {
            return;
        }

        match state {
            ConnectionState::Connected => match teardown {
                Teardown::Immediate => self.disconnect_link(conn),
                Teardown::Linger => self.arm_linger(conn),
            },
            ConnectionState::Idle => {
                self.registry.remove_connection(conn);
            }
            // Handled on link up / link down
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }

    /// Send a disconnection request, dropping any data the channel holds
    pub(crate) fn local_disconnect(&mut self, conn: ConnId, lcid: u16, reason: Option<DisconnectReason>) {
        let Some(channel) = self
            .registry
            .connection_mut(conn)
            .and_then(|c| c.channel_mut(lcid))
        else {
            return;
        };
        channel.stop_mode();
        channel.state = ChannelState::DisconnectOutReq;
        let rcid = channel.remote_cid;
        self.cancel_channel_timers(lcid);

        self.send_request(conn, Some(lcid), |identifier| SignalingMessage::DisconnectionRequest {
            identifier,
            destination_cid: rcid,
            source_cid: lcid,
        });
        if let Some(reason) = reason {
            self.report_abnormal(lcid, reason);
        }
    }

    /// Report an abnormal disconnect once per channel
    pub(crate) fn report_abnormal(&mut self, lcid: u16, reason: DisconnectReason) {
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        if channel.abnormal_reported {
            return;
        }
        channel.abnormal_reported = true;
        warn!("Channel 0x{:04X} disconnected abnormally: {}", lcid, reason);
        let key = channel.service_key();
        self.events
            .push_back((key, lcid, ServiceEvent::DisconnectAbnormal(reason)));
    }

    pub(crate) fn notify(&mut self, lcid: u16, event: ServiceEvent) {
        if let Some(channel) = self.registry.channel(lcid) {
            let key = channel.service_key();
            self.events.push_back((key, lcid, event));
        }
    }

    pub(crate) fn connection_info(&self, conn: ConnId) -> Option<ConnectionInfo> {
        let connection = self.registry.connection(conn)?;
        Some(ConnectionInfo {
            handle: connection.handle?,
            address: connection.address,
            kind: connection.kind,
        })
    }

    /// Mark a channel connected and start its flow control engine
    pub(crate) fn enter_connected(&mut self, lcid: u16) {
        let settings = &self.settings;
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.state = ChannelState::Connected;
        channel.start_mode(
            settings.retransmission_timeout,
            settings.monitor_timeout,
            settings.tx_buffer_size,
        );
        info!("{} connected", channel);
        self.notify(lcid, ServiceEvent::Connected);
    }

    /// Deliver queued service events
    pub(crate) fn flush_events(&mut self) {
        while let Some((key, lcid, event)) = self.events.pop_front() {
            let service = match key {
                ServiceKey::Classic(psm) => self.services.get_mut(&psm).map(|r| &mut r.service),
                ServiceKey::Le(psm) => self.le_services.get_mut(&psm).map(|r| &mut r.service),
            };
            match service {
                Some(service) => {
                    debug!("Delivering {} to channel 0x{:04X}", event.name(), lcid);
                    event.deliver(service.as_mut(), lcid);
                }
                None => debug!("No service for {:?}, dropping {}", key, event.name()),
            }
        }
    }

    pub(crate) fn transmit(&mut self, handle: Option<u16>, flush_timeout: u16, bytes: &[u8]) {
        let Some(handle) = handle else {
            warn!("Dropping {} byte frame: link not up", bytes.len());
            return;
        };
        trace!("TX handle 0x{:04X}: {}", handle, hex::encode(bytes));
        if let Err(e) = self.link.send(handle, flush_timeout, bytes) {
            error!("Send on handle 0x{:04X} failed: {}", handle, e);
        }
    }

    /// Send a command that expects no response
    pub(crate) fn send_signal(&mut self, conn: ConnId, message: SignalingMessage) {
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        debug!("TX signaling: {:?}", message);
        let bytes = message.to_packet(connection.is_le()).to_bytes();
        let handle = connection.handle;
        self.transmit(handle, L2CAP_DEFAULT_FLUSH_TIMEOUT, &bytes);
    }

    /// Send a request and track it until answered or timed out
    pub(crate) fn send_request(
        &mut self,
        conn: ConnId,
        lcid: Option<u16>,
        build: impl FnOnce(u8) -> SignalingMessage,
    ) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let Some(handle) = connection.handle else {
            warn!("Cannot send request: link not up");
            return;
        };
        let identifier = connection.next_identifier();
        let message = build(identifier);
        connection.add_pending(PendingRequest {
            identifier,
            code: message.command_code(),
            lcid,
        });
        self.timers
            .schedule(TimerId::Response { handle, identifier }, self.settings.rtx);
        self.send_signal(conn, message);
    }

    /// Drop the pending request answered by `identifier`
    pub(crate) fn drop_pending(&mut self, conn: ConnId, identifier: u8) -> Option<PendingRequest> {
        let connection = self.registry.connection_mut(conn)?;
        let request = connection.take_pending(identifier)?;
        if let Some(handle) = connection.handle {
            self.timers.cancel(TimerId::Response { handle, identifier });
        }
        Some(request)
    }

    /// Re-arm a pending request with ERTX after a "pending" answer
    pub(crate) fn extend_pending(&mut self, conn: ConnId, identifier: u8) {
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        let Some(handle) = connection.handle else {
            return;
        };
        if connection.pending().iter().any(|p| p.identifier == identifier) {
            self.timers
                .schedule(TimerId::Response { handle, identifier }, self.settings.ertx);
        }
    }

    pub(crate) fn send_command_reject(&mut self, conn: ConnId, identifier: u8, reason: u16, data: Vec<u8>) {
        warn!("Rejecting command id {} with reason 0x{:04X}", identifier, reason);
        self.send_signal(
            conn,
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data,
            },
        );
    }

    /// Command reject received on either signaling channel
    pub(crate) fn handle_command_reject(&mut self, conn: ConnId, identifier: u8, reason: u16, data: &[u8]) {
        let request = self.drop_pending(conn, identifier);
        warn!("Peer rejected command id {} with reason 0x{:04X}", identifier, reason);

        if reason == L2CAP_REJECT_INVALID_CID {
            // Second endpoint is the source CID of the rejected command: ours
            let named = (data.len() >= 4)
                .then(|| u16::from_le_bytes([data[2], data[3]]))
                .filter(|cid| *cid != 0);
            let Some(lcid) = named.or(request.and_then(|r| r.lcid)) else {
                return;
            };
            if self.registry.connection(conn).and_then(|c| c.channel(lcid)).is_some() {
                self.report_abnormal(lcid, DisconnectReason::Rejected);
                self.delete_channel(conn, lcid, Teardown::Immediate);
            }
            return;
        }

        let Some(request) = request else {
            return;
        };
        match (request.code, request.lcid) {
            (L2CAP_INFORMATION_REQUEST, _) => self.information_done(conn),
            (L2CAP_DISCONNECTION_REQUEST, Some(lcid)) => self.delete_channel(conn, lcid, Teardown::Immediate),
            (L2CAP_CONNECTION_REQUEST | L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST, Some(lcid)) => {
                self.report_abnormal(lcid, DisconnectReason::Rejected);
                self.delete_channel(conn, lcid, Teardown::Immediate);
            }
            (_, Some(lcid)) => self.local_disconnect(conn, lcid, None),
            (_, None) => {}
        }
    }

    /// Disconnection request received on either signaling channel
    pub(crate) fn handle_disconnection_request(&mut self, conn: ConnId, identifier: u8, dcid: u16, scid: u16) {
        let Some(channel) = self
            .registry
            .connection_mut(conn)
            .and_then(|c| c.channel_mut(dcid))
            .filter(|c| c.remote_cid == scid)
        else {
            let mut data = dcid.to_le_bytes().to_vec();
            data.extend_from_slice(&scid.to_le_bytes());
            self.send_command_reject(conn, identifier, L2CAP_REJECT_INVALID_CID, data);
            return;
        };

        let response = SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: dcid,
            source_cid: scid,
        };
        if channel.state == ChannelState::DisconnectOutReq {
            // Both sides closing: our own response completes the channel
            self.send_signal(conn, response);
            return;
        }

        channel.stop_mode();
        channel.state = ChannelState::DisconnectInReq;
        channel.disconnect_identifier = identifier;
        let key = channel.service_key();
        self.cancel_channel_timers(dcid);
        self.notify(dcid, ServiceEvent::DisconnectRequest { identifier });

        if self.policy(key).auto_accept {
            self.send_signal(conn, response);
            self.delete_channel(conn, dcid, Teardown::Linger);
        }
    }

    /// Disconnection response received on either signaling channel
    pub(crate) fn handle_disconnection_response(&mut self, conn: ConnId, identifier: u8, dcid: u16, scid: u16) {
        self.drop_pending(conn, identifier);
        let Some(channel) = self.registry.connection(conn).and_then(|c| c.channel(scid)) else {
            debug!("Disconnection response for unknown channel 0x{:04X}", scid);
            return;
        };
        if channel.remote_cid != dcid || channel.state != ChannelState::DisconnectOutReq {
            debug!("Ignoring disconnection response for {}", channel);
            return;
        }

        let key = channel.service_key();
        let reported = channel.abnormal_reported;
        self.delete_channel(conn, scid, Teardown::Linger);
        if !reported {
            self.events.push_back((key, scid, ServiceEvent::DisconnectResponse));
        }
    }
}

/// LE credit based connection response refusing with `result`
pub(crate) fn le_refusal(identifier: u8, result: u16) -> SignalingMessage {
    SignalingMessage::LeCreditBasedConnectionResponse {
        identifier,
        destination_cid: 0,
        mtu: 0,
        mps: 0,
        initial_credits: 0,
        result,
    }
}

impl L2capManager {
    pub(crate) fn run_erfc_actions(&mut self, conn: ConnId, lcid: u16) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let handle = connection.handle;
        let Some(channel) = connection.channel_mut(lcid) else {
            return;
        };
        let key = channel.service_key();
        let flush = channel.local_config.flush_timeout;
        let ModeState::Erfc(engine) = &mut channel.mode else {
            return;
        };

        for action in engine.take_actions() {
            match action {
                ErfcAction::Transmit(bytes) => self.transmit(handle, flush, &bytes),
                ErfcAction::StartRetransmissionTimer(after) => {
                    self.timers.schedule(TimerId::Retransmission { lcid }, after)
                }
                ErfcAction::StopRetransmissionTimer => self.timers.cancel(TimerId::Retransmission { lcid }),
                ErfcAction::StartMonitorTimer(after) => self.timers.schedule(TimerId::Monitor { lcid }, after),
                ErfcAction::StopMonitorTimer => self.timers.cancel(TimerId::Monitor { lcid }),
                ErfcAction::Deliver(sdu) => self.events.push_back((key, lcid, ServiceEvent::Data(sdu))),
                ErfcAction::RemoteBusy(busy) => {
                    self.events.push_back((key, lcid, ServiceEvent::RemoteBusy(busy)))
                }
                ErfcAction::Disconnect => {
                    warn!("Channel 0x{:04X} reached its retransmission limit", lcid);
                    self.local_disconnect(conn, lcid, Some(DisconnectReason::ProtocolError));
                    return;
                }
            }
        }
    }

    pub(crate) fn run_credit_actions(&mut self, conn: ConnId, lcid: u16) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let handle = connection.handle;
        let Some(channel) = connection.channel_mut(lcid) else {
            return;
        };
        let key = channel.service_key();
        let ModeState::Credit(engine) = &mut channel.mode else {
            return;
        };

        for action in engine.take_actions() {
            match action {
                CreditAction::Transmit(bytes) => self.transmit(handle, L2CAP_DEFAULT_FLUSH_TIMEOUT, &bytes),
                CreditAction::Deliver(sdu) => self.events.push_back((key, lcid, ServiceEvent::Data(sdu))),
                CreditAction::RemoteBusy(busy) => {
                    self.events.push_back((key, lcid, ServiceEvent::RemoteBusy(busy)))
                }
                CreditAction::Disconnect => {
                    self.local_disconnect(conn, lcid, Some(DisconnectReason::ProtocolError));
                    return;
                }
                CreditAction::GrantCredits(credits) => {
                    let Some(identifier) = self.registry.connection_mut(conn).map(Connection::next_identifier)
                    else {
                        return;
                    };
                    self.send_signal(
                        conn,
                        SignalingMessage::LeFlowControlCredit {
                            identifier,
                            cid: lcid,
                            credits,
                        },
                    );
                }
            }
        }
    }
}
