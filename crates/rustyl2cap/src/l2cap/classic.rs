//! BR/EDR signaling: connection setup, configuration negotiation,
//! information discovery and echo

use log::{debug, warn};

use super::channel::{ConfigProgress, L2capChannel};
use super::connection::InfoState;
use super::constants::*;
use super::core::{L2capManager, Teardown};
use super::packet::L2capCommandHeader;
use super::registry::ConnId;
use super::service::ServiceEvent;
use super::signaling::{listed_option_types, parse_config_options, serialize_config_options, SignalingMessage};
use super::types::*;

/// Configuration requests resent after "unacceptable parameters" before
/// the channel is given up
const MAX_CONFIG_ATTEMPTS: u8 = 3;

/// Rank used to converge on one mode: a peer proposing a simpler mode
/// than ours is accepted, a more complex one is countered
fn mode_rank(mode: RetransmissionMode) -> u8 {
    match mode {
        RetransmissionMode::Basic => 0,
        RetransmissionMode::EnhancedRetransmission => 1,
        RetransmissionMode::Streaming => 2,
        RetransmissionMode::Retransmission | RetransmissionMode::FlowControl => u8::MAX,
    }
}

impl L2capManager {
    /// Process one classic signaling frame, which may hold several commands
    pub(crate) fn handle_classic_signaling(&mut self, conn: ConnId, payload: &[u8]) {
        if payload.len() > self.settings.signaling_mtu as usize {
            let identifier = payload.get(1).copied().unwrap_or(0);
            let data = self.settings.signaling_mtu.to_le_bytes().to_vec();
            self.send_command_reject(conn, identifier, L2CAP_REJECT_SIGNALING_MTU_EXCEEDED, data);
            return;
        }

        let mut rest = payload;
        while !rest.is_empty() {
            if self.registry.connection(conn).is_none() {
                return;
            }
            let Some(header) = L2capCommandHeader::parse(rest) else {
                let identifier = rest.get(1).copied().unwrap_or(0);
                self.send_command_reject(conn, identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                return;
            };
            let end = L2CAP_COMMAND_HEADER_SIZE + header.length as usize;
            let Some(params) = rest.get(L2CAP_COMMAND_HEADER_SIZE..end) else {
                warn!(
                    "Command 0x{:02X} declares {} bytes, {} remain",
                    header.code,
                    header.length,
                    rest.len() - L2CAP_COMMAND_HEADER_SIZE
                );
                self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                return;
            };
            rest = &rest[end..];

            if !SignalingMessage::is_allowed(header.code, false) {
                self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                continue;
            }
            match SignalingMessage::parse_command(&header, params) {
                Ok(message) => self.dispatch_classic(conn, message),
                Err(e) => {
                    warn!("Malformed command 0x{:02X}: {}", header.code, e);
                    // A reject is never answered with a reject
                    if header.code != L2CAP_COMMAND_REJECT {
                        self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                    }
                }
            }
        }
    }

    fn dispatch_classic(&mut self, conn: ConnId, message: SignalingMessage) {
        debug!("RX signaling: {:?}", message);
        match message {
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data,
            } => self.handle_command_reject(conn, identifier, reason, &data),
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.handle_connection_request(conn, identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            } => self.handle_connection_response(conn, identifier, destination_cid, source_cid, result, status),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.handle_configure_request(conn, identifier, destination_cid, flags, &options),
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                flags,
                result,
                options,
            } => self.handle_configure_response(conn, identifier, source_cid, flags, result, &options),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_request(conn, identifier, destination_cid, source_cid),
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            } => self.handle_disconnection_response(conn, identifier, destination_cid, source_cid),
            SignalingMessage::EchoRequest { identifier, data } => self.handle_echo_request(conn, identifier, &data),
            SignalingMessage::EchoResponse { identifier, data } => {
                self.drop_pending(conn, identifier);
                let handle = self.registry.connection(conn).and_then(|c| c.handle);
                if let (Some(handler), Some(handle)) = (self.echo_handler.as_mut(), handle) {
                    handler.on_echo_response(handle, &data);
                }
            }
            SignalingMessage::InformationRequest { identifier, info_type } => {
                self.handle_information_request(conn, identifier, info_type)
            }
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            } => self.handle_information_response(conn, identifier, info_type, result, &data),
            other => debug!("Ignoring LE command on classic link: {:?}", other),
        }
    }

    pub(crate) fn send_info_request(&mut self, conn: ConnId, info_type: u16) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        connection.info_state = InfoState::Processing;
        self.send_request(conn, None, |identifier| SignalingMessage::InformationRequest {
            identifier,
            info_type,
        });
    }

    fn handle_information_request(&mut self, conn: ConnId, identifier: u8, info_type: u16) {
        let (result, data) = match info_type {
            L2CAP_INFO_EXTENDED_FEATURES => {
                let features = L2CAP_FEATURE_ENHANCED_RETRANSMISSION
                    | L2CAP_FEATURE_STREAMING
                    | L2CAP_FEATURE_FCS
                    | L2CAP_FEATURE_FIXED_CHANNELS;
                (L2CAP_INFO_SUCCESS, features.to_le_bytes().to_vec())
            }
            L2CAP_INFO_FIXED_CHANNELS => (L2CAP_INFO_SUCCESS, L2CAP_FIXED_CHANNEL_SIGNALING.to_le_bytes().to_vec()),
            _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };
        self.send_signal(
            conn,
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            },
        );
    }

    fn handle_information_response(&mut self, conn: ConnId, identifier: u8, info_type: u16, result: u16, data: &[u8]) {
        if self.drop_pending(conn, identifier).is_none() {
            debug!("Unsolicited information response id {}", identifier);
            return;
        }
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };

        match info_type {
            L2CAP_INFO_EXTENDED_FEATURES => {
                connection.extended_features = match (result, data) {
                    (L2CAP_INFO_SUCCESS, [a, b, c, d, ..]) => u32::from_le_bytes([*a, *b, *c, *d]),
                    _ => 0,
                };
                debug!("Peer extended features: 0x{:08X}", connection.extended_features);
                if connection.extended_features & L2CAP_FEATURE_FIXED_CHANNELS != 0 {
                    self.send_info_request(conn, L2CAP_INFO_FIXED_CHANNELS);
                    return;
                }
            }
            L2CAP_INFO_FIXED_CHANNELS => {
                if result == L2CAP_INFO_SUCCESS && data.len() >= 8 {
                    let mut mask = [0u8; 8];
                    mask.copy_from_slice(&data[..8]);
                    connection.fixed_channels = u64::from_le_bytes(mask);
                }
            }
            other => debug!("Information response of unexpected type {}", other),
        }
        self.information_done(conn);
    }

    /// Discovery finished: let every waiting channel proceed
    pub(crate) fn information_done(&mut self, conn: ConnId) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        connection.info_state = InfoState::Done;

        for lcid in connection.channel_ids() {
            match self.registry.channel(lcid).map(|c| c.state) {
                Some(ChannelState::Idle) => self.send_connection_request(conn, lcid),
                Some(ChannelState::ConnectInReq) => self.present_incoming(conn, lcid),
                _ => {}
            }
        }
    }

    pub(crate) fn send_connection_request(&mut self, conn: ConnId, lcid: u16) {
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.state = ChannelState::ConnectOutReq;
        let psm = channel.remote_psm;
        self.send_request(conn, Some(lcid), |identifier| SignalingMessage::ConnectionRequest {
            identifier,
            psm,
            source_cid: lcid,
        });
    }

    fn handle_connection_request(&mut self, conn: ConnId, identifier: u8, psm: u16, scid: u16) {
        let refuse = |result| SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: 0,
            source_cid: scid,
            result,
            status: L2CAP_STATUS_NO_INFORMATION,
        };

        let Some(registration) = self.services.get(&psm) else {
            debug!("Connection request for unregistered PSM 0x{:04X}", psm);
            self.send_signal(conn, refuse(L2CAP_CONNECTION_PSM_NOT_SUPPORTED));
            return;
        };
        let config = registration.config;
        if scid < L2CAP_DYNAMIC_CID_MIN {
            self.send_signal(conn, refuse(L2CAP_CONNECTION_INVALID_SOURCE_CID));
            return;
        }
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        if connection.lcid_for_remote(scid).is_some() {
            self.send_signal(conn, refuse(L2CAP_CONNECTION_SOURCE_CID_ALREADY_ALLOCATED));
            return;
        }
        let info_state = connection.info_state;

        let Some(lcid) = self.registry.new_channel(conn, |lcid| {
            let mut channel = L2capChannel::new_classic(lcid, psm, psm, config);
            channel.remote_cid = scid;
            channel.state = ChannelState::ConnectInReq;
            channel.connect_identifier = identifier;
            channel
        }) else {
            self.send_signal(conn, refuse(L2CAP_CONNECTION_NO_RESOURCES));
            return;
        };
        self.cancel_linger(conn);
        debug!("Inbound channel 0x{:04X} for PSM 0x{:04X}", lcid, psm);

        if info_state == InfoState::Done {
            self.present_incoming(conn, lcid);
            return;
        }
        self.send_signal(
            conn,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: lcid,
                source_cid: scid,
                result: L2CAP_CONNECTION_PENDING,
                status: L2CAP_STATUS_NO_INFORMATION,
            },
        );
        if info_state == InfoState::None {
            self.send_info_request(conn, L2CAP_INFO_EXTENDED_FEATURES);
        }
    }

    /// Report an inbound connection to its service, answering it when the
    /// policy allows
    fn present_incoming(&mut self, conn: ConnId, lcid: u16) {
        let Some(info) = self.connection_info(conn) else {
            return;
        };
        let Some(channel) = self.registry.channel(lcid) else {
            return;
        };
        let (identifier, remote_psm, key) = (channel.connect_identifier, channel.remote_psm, channel.service_key());
        self.notify(
            lcid,
            ServiceEvent::ConnectRequest {
                identifier,
                info,
                remote_psm,
            },
        );
        if self.policy(key).auto_accept {
            self.answer_connection(conn, lcid, identifier, L2CAP_CONNECTION_SUCCESSFUL, L2CAP_STATUS_NO_INFORMATION);
        }
    }

    fn answer_connection(&mut self, conn: ConnId, lcid: u16, identifier: u8, result: u16, status: u16) {
        let Some(rcid) = self.registry.channel(lcid).map(|c| c.remote_cid) else {
            return;
        };
        let destination_cid = if result == L2CAP_CONNECTION_SUCCESSFUL || result == L2CAP_CONNECTION_PENDING {
            lcid
        } else {
            0
        };
        self.send_signal(
            conn,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid: rcid,
                result,
                status,
            },
        );

        match result {
            L2CAP_CONNECTION_SUCCESSFUL => self.begin_configuration(conn, lcid),
            L2CAP_CONNECTION_PENDING => {}
            _ => self.delete_channel(conn, lcid, Teardown::Linger),
        }
    }

    /// Answer an inbound connection request reported to a manual service
    pub fn connect_response(&mut self, lcid: u16, identifier: u8, result: u16, status: u16) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let channel = self.registry.channel(lcid).ok_or(L2capError::ChannelNotFound(lcid))?;
        if channel.is_le() {
            return Err(L2capError::NotSupported);
        }
        if channel.state != ChannelState::ConnectInReq {
            return Err(L2capError::InvalidState(channel.state));
        }

        self.answer_connection(conn, lcid, identifier, result, status);
        self.flush_events();
        Ok(())
    }

    fn handle_connection_response(
        &mut self,
        conn: ConnId,
        identifier: u8,
        dcid: u16,
        scid: u16,
        result: u16,
        status: u16,
    ) {
        if result == L2CAP_CONNECTION_PENDING {
            self.extend_pending(conn, identifier);
        } else {
            self.drop_pending(conn, identifier);
        }

        let Some(channel) = self.registry.connection_mut(conn).and_then(|c| c.channel_mut(scid)) else {
            debug!("Connection response for unknown channel 0x{:04X}", scid);
            return;
        };
        if channel.state != ChannelState::ConnectOutReq {
            debug!("Ignoring connection response for {}", channel);
            return;
        }
        if result == L2CAP_CONNECTION_SUCCESSFUL {
            channel.remote_cid = dcid;
        }

        if let Some(info) = self.connection_info(conn) {
            self.notify(scid, ServiceEvent::ConnectResponse { info, result, status });
        }
        match result {
            L2CAP_CONNECTION_SUCCESSFUL => self.begin_configuration(conn, scid),
            L2CAP_CONNECTION_PENDING => {}
            _ => {
                debug!("Peer refused channel 0x{:04X} with result 0x{:04X}", scid, result);
                self.delete_channel(conn, scid, Teardown::Immediate);
            }
        }
    }

    /// Enter CONFIGURING and, for auto-accepting services, propose our
    /// configuration
    fn begin_configuration(&mut self, conn: ConnId, lcid: u16) {
        let Some(features) = self.registry.connection(conn).map(|c| c.extended_features) else {
            return;
        };
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.state = ChannelState::Configuring;
        channel.progress = ConfigProgress::empty();
        channel.config_attempts = 0;

        let mode = channel.local_config.rfc.mode;
        let needed = match mode {
            RetransmissionMode::EnhancedRetransmission => L2CAP_FEATURE_ENHANCED_RETRANSMISSION,
            RetransmissionMode::Streaming => L2CAP_FEATURE_STREAMING,
            _ => 0,
        };
        if needed != 0 && features & needed == 0 {
            debug!("Peer lacks {:?} support, channel 0x{:04X} falls back to basic", mode, lcid);
            channel.local_config.rfc = RetransmissionFlowControl::default();
        }

        let key = channel.service_key();
        if self.policy(key).auto_accept {
            self.send_config_request(conn, lcid);
        }
    }

    fn send_config_request(&mut self, conn: ConnId, lcid: u16) {
        let Some(channel) = self.registry.channel(lcid) else {
            return;
        };
        let rcid = channel.remote_cid;
        let options = serialize_config_options(&channel.local_config.to_request_options());
        self.send_request(conn, Some(lcid), |identifier| SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: rcid,
            flags: 0,
            options,
        });
    }

    /// Propose `config` on a channel owned by a manual service
    pub fn configure(&mut self, lcid: u16, config: ChannelConfig) -> L2capResult<()> {
        if config.mtu < self.settings.min_mtu || !config.rfc.mode.is_supported() {
            return Err(L2capError::InvalidParameter(format!(
                "Unusable configuration: MTU {} mode {:?}",
                config.mtu, config.rfc.mode
            )));
        }
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let channel = self
            .registry
            .channel_mut(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        if channel.is_le() {
            return Err(L2capError::NotSupported);
        }
        if channel.state != ChannelState::Configuring {
            return Err(L2capError::InvalidState(channel.state));
        }

        channel.local_config = config;
        self.send_config_request(conn, lcid);
        self.flush_events();
        Ok(())
    }

    fn handle_configure_request(&mut self, conn: ConnId, identifier: u8, dcid: u16, flags: u16, options: &[u8]) {
        let limit = self.settings.signaling_mtu as usize;
        let Some(channel) = self.registry.connection_mut(conn).and_then(|c| c.channel_mut(dcid)) else {
            let mut data = dcid.to_le_bytes().to_vec();
            data.extend_from_slice(&0u16.to_le_bytes());
            self.send_command_reject(conn, identifier, L2CAP_REJECT_INVALID_CID, data);
            return;
        };
        let rcid = channel.remote_cid;
        let respond = |result: ConfigResult, flags: u16, options: Vec<u8>| SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: rcid,
            flags,
            result: result.value(),
            options,
        };

        if channel.state != ChannelState::Configuring {
            // Reconfiguration of an open channel is not supported
            debug!("Configuration request for {} refused", channel);
            self.send_signal(conn, respond(ConfigResult::Rejected, 0, Vec::new()));
            return;
        }

        let more = flags & L2CAP_CONF_FLAG_CONTINUATION != 0;
        let block = match channel.fragments.push(options, more, limit) {
            Ok(Some(block)) => block,
            Ok(None) => {
                self.send_signal(
                    conn,
                    respond(ConfigResult::Success, L2CAP_CONF_FLAG_CONTINUATION, Vec::new()),
                );
                return;
            }
            Err(e) => {
                warn!("Channel 0x{:04X}: {}", dcid, e);
                self.send_command_reject(conn, identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                return;
            }
        };

        let parsed = match parse_config_options(&block) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Rejecting configuration of channel 0x{:04X}: {}", dcid, e);
                self.send_signal(conn, respond(ConfigResult::Rejected, 0, Vec::new()));
                return;
            }
        };
        if !parsed.unknown.is_empty() {
            debug!("Channel 0x{:04X}: unknown options {}", dcid, hex::encode(&parsed.unknown));
            self.send_signal(conn, respond(ConfigResult::UnknownOptions, 0, parsed.unknown));
            return;
        }

        let mut proposal = ChannelConfig::basic(L2CAP_DEFAULT_MTU);
        let requested = parsed.options;
        if let Some(mtu) = requested.mtu {
            proposal.mtu = mtu;
        }
        if let Some(flush) = requested.flush_timeout {
            proposal.flush_timeout = flush;
        }
        if let Some(rfc) = requested.retransmission {
            proposal.rfc = rfc;
        }
        proposal.qos = requested.qos;
        proposal.fcs = requested.fcs != Some(L2CAP_FCS_NONE);

        let key = channel.service_key();
        channel.pending_remote = Some(proposal);
        self.notify(dcid, ServiceEvent::ConfigRequest { identifier, config: proposal });

        if !self.policy(key).auto_accept {
            return;
        }
        match self.evaluate_proposal(dcid, &proposal) {
            None => self.accept_config_request(conn, dcid, identifier, proposal),
            Some(suggestions) => {
                debug!("Channel 0x{:04X}: countering proposal with {:?}", dcid, suggestions);
                let options = serialize_config_options(&suggestions);
                self.send_signal(conn, respond(ConfigResult::UnacceptableParameters, 0, options));
            }
        }
    }

    /// Values to counter a peer proposal with, or `None` if it is acceptable
    fn evaluate_proposal(&self, lcid: u16, proposal: &ChannelConfig) -> Option<ConfigOptions> {
        let local = self.registry.channel(lcid)?.local_config;
        let mut suggestions = ConfigOptions::default();
        let mut acceptable = true;

        if proposal.mtu < self.settings.min_mtu {
            suggestions.mtu = Some(self.settings.min_mtu);
            acceptable = false;
        } else if proposal.mtu > local.mtu {
            suggestions.mtu = Some(local.mtu);
            acceptable = false;
        }

        let mode = proposal.rfc.mode;
        if !mode.is_supported() || mode_rank(mode) > mode_rank(local.rfc.mode) {
            suggestions.retransmission = Some(local.rfc);
            acceptable = false;
        } else if mode != RetransmissionMode::Basic
            && (1..=L2CAP_SDU_LENGTH_SIZE).contains(&(proposal.rfc.mps as usize))
        {
            // A start segment must fit the SDU length and one data byte; 0
            // leaves the MPS to our transmit buffer
            suggestions.retransmission = Some(RetransmissionFlowControl {
                mps: self.settings.mps.min(self.settings.rx_buffer_size),
                ..proposal.rfc
            });
            acceptable = false;
        }

        (!acceptable).then_some(suggestions)
    }

    fn accept_config_request(&mut self, conn: ConnId, lcid: u16, identifier: u8, mut proposal: ChannelConfig) {
        let settings = &self.settings;
        let (tx_buffer, rtx, monitor) = (
            settings.tx_buffer_size,
            settings.retransmission_timeout,
            settings.monitor_timeout,
        );
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };

        let mut options = ConfigOptions::default();
        if proposal.rfc.mode != RetransmissionMode::Basic {
            proposal.rfc.mps = proposal.rfc.mps.min(tx_buffer);
            options.retransmission = Some(RetransmissionFlowControl {
                retransmission_timeout: rtx,
                monitor_timeout: monitor,
                ..proposal.rfc
            });
        }
        channel.remote_config = proposal;
        channel.pending_remote = None;
        channel.progress |= ConfigProgress::IN_DONE;
        let (rcid, configured) = (channel.remote_cid, channel.is_configured());

        self.send_signal(
            conn,
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: rcid,
                flags: 0,
                result: ConfigResult::Success.value(),
                options: serialize_config_options(&options),
            },
        );
        if configured {
            self.enter_connected(lcid);
        }
    }

    /// Answer a configuration request reported to a manual service
    ///
    /// `options` carries the counter-proposal for a refusing `result`.
    pub fn config_response(
        &mut self,
        lcid: u16,
        identifier: u8,
        result: ConfigResult,
        options: ConfigOptions,
    ) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let channel = self
            .registry
            .channel_mut(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        if channel.state != ChannelState::Configuring {
            return Err(L2capError::InvalidState(channel.state));
        }

        if result == ConfigResult::Success {
            let proposal = channel
                .pending_remote
                .ok_or(L2capError::InvalidState(channel.state))?;
            self.accept_config_request(conn, lcid, identifier, proposal);
        } else {
            let rcid = channel.remote_cid;
            self.send_signal(
                conn,
                SignalingMessage::ConfigureResponse {
                    identifier,
                    source_cid: rcid,
                    flags: 0,
                    result: result.value(),
                    options: serialize_config_options(&options),
                },
            );
        }
        self.flush_events();
        Ok(())
    }

    fn handle_configure_response(
        &mut self,
        conn: ConnId,
        identifier: u8,
        scid: u16,
        flags: u16,
        result: u16,
        options: &[u8],
    ) {
        let result = ConfigResult::from_u16(result);
        if result == Some(ConfigResult::Pending) {
            self.extend_pending(conn, identifier);
        } else {
            self.drop_pending(conn, identifier);
        }

        let Some(channel) = self.registry.connection_mut(conn).and_then(|c| c.channel_mut(scid)) else {
            debug!("Configuration response for unknown channel 0x{:04X}", scid);
            return;
        };
        if channel.state != ChannelState::Configuring {
            debug!("Ignoring configuration response for {}", channel);
            return;
        }
        let parsed = match parse_config_options(options) {
            Ok(parsed) => parsed.options,
            Err(e) => {
                warn!("Malformed options in configuration response: {}", e);
                ConfigOptions::default()
            }
        };
        let key = channel.service_key();
        let auto = self.policy(key).auto_accept;

        let Some(result) = result else {
            warn!("Unknown configuration result on channel 0x{:04X}", scid);
            if auto {
                self.local_disconnect(conn, scid, None);
            }
            return;
        };

        let Some(channel) = self.registry.channel_mut(scid) else {
            return;
        };
        let config = channel.local_config;
        match result {
            ConfigResult::Success => {
                if let Some(rfc) = parsed.retransmission {
                    // Peer supplies the timeouts our transmitter runs with
                    if rfc.retransmission_timeout != 0 {
                        channel.local_config.rfc.retransmission_timeout = rfc.retransmission_timeout;
                    }
                    if rfc.monitor_timeout != 0 {
                        channel.local_config.rfc.monitor_timeout = rfc.monitor_timeout;
                    }
                }
                if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
                    // More response fragments follow; ask for them
                    let rcid = channel.remote_cid;
                    self.send_request(conn, Some(scid), |identifier| SignalingMessage::ConfigureRequest {
                        identifier,
                        destination_cid: rcid,
                        flags: 0,
                        options: Vec::new(),
                    });
                    return;
                }
                channel.progress |= ConfigProgress::OUT_DONE;
                let configured = channel.is_configured();
                let config = channel.local_config;
                self.notify(scid, ServiceEvent::ConfigResponse { result, config });
                if configured {
                    self.enter_connected(scid);
                }
            }
            ConfigResult::Pending => {
                self.notify(scid, ServiceEvent::ConfigResponse { result, config });
            }
            ConfigResult::UnacceptableParameters => {
                self.notify(scid, ServiceEvent::ConfigResponse { result, config });
                if auto {
                    self.renegotiate(conn, scid, parsed);
                }
            }
            ConfigResult::UnknownOptions => {
                self.notify(scid, ServiceEvent::ConfigResponse { result, config });
                if auto {
                    self.reoffer_without(conn, scid, &listed_option_types(options));
                }
            }
            ConfigResult::Rejected | ConfigResult::FlowSpecRejected => {
                debug!("Peer refused configuration of channel 0x{:04X}: {:?}", scid, result);
                self.notify(scid, ServiceEvent::ConfigResponse { result, config });
                if auto {
                    self.local_disconnect(conn, scid, None);
                }
            }
        }
    }

    /// Adopt the values suggested in an "unacceptable parameters" response
    /// and propose again
    fn renegotiate(&mut self, conn: ConnId, lcid: u16, suggested: ConfigOptions) {
        let (min_mtu, rx_buffer) = (self.settings.min_mtu, self.settings.rx_buffer_size);
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.config_attempts += 1;
        if channel.config_attempts > MAX_CONFIG_ATTEMPTS {
            warn!("Channel 0x{:04X}: configuration did not converge", lcid);
            self.local_disconnect(conn, lcid, None);
            return;
        }

        if let Some(mtu) = suggested.mtu {
            if mtu < min_mtu {
                warn!("Channel 0x{:04X}: peer suggests MTU {} below minimum", lcid, mtu);
                self.local_disconnect(conn, lcid, None);
                return;
            }
            channel.local_config.mtu = mtu;
        }
        if let Some(flush) = suggested.flush_timeout {
            channel.local_config.flush_timeout = flush;
        }
        if let Some(rfc) = suggested.retransmission {
            if !rfc.mode.is_supported() {
                warn!("Channel 0x{:04X}: peer insists on unsupported mode {:?}", lcid, rfc.mode);
                self.local_disconnect(conn, lcid, None);
                return;
            }
            if rfc.mode != channel.local_config.rfc.mode {
                let settings = &self.settings;
                channel.local_config.rfc = settings.channel_config(rfc.mode).rfc;
            } else if rfc.mps > channel.local_config.rfc.mps {
                channel.local_config.rfc.mps = rfc.mps.min(rx_buffer);
            }
        }
        self.send_config_request(conn, lcid);
    }

    /// Propose again without the options the peer did not recognise
    ///
    /// An MTU the peer cannot parse falls back to the default it assumes.
    fn reoffer_without(&mut self, conn: ConnId, lcid: u16, listed: &[u8]) {
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.config_attempts += 1;
        if channel.config_attempts > MAX_CONFIG_ATTEMPTS {
            warn!("Channel 0x{:04X}: configuration did not converge", lcid);
            self.local_disconnect(conn, lcid, None);
            return;
        }

        debug!("Channel 0x{:04X}: peer does not know options {:02X?}", lcid, listed);
        let config = &mut channel.local_config;
        for &option_type in listed {
            match option_type {
                L2CAP_CONF_MTU => config.mtu = L2CAP_DEFAULT_MTU,
                L2CAP_CONF_FLUSH_TIMEOUT => config.flush_timeout = L2CAP_DEFAULT_FLUSH_TIMEOUT,
                L2CAP_CONF_QOS => config.qos = None,
                L2CAP_CONF_RFC => config.rfc = RetransmissionFlowControl::default(),
                // FCS is only sent to turn it off
                L2CAP_CONF_FCS => config.fcs = true,
                _ => {}
            }
        }
        self.send_config_request(conn, lcid);
    }

    fn handle_echo_request(&mut self, conn: ConnId, identifier: u8, data: &[u8]) {
        let handle = self.registry.connection(conn).and_then(|c| c.handle);
        let reply = match (self.echo_handler.as_mut(), handle) {
            (Some(handler), Some(handle)) => handler.on_echo_request(handle, data),
            _ => Vec::new(),
        };
        self.send_signal(conn, SignalingMessage::EchoResponse { identifier, data: reply });
    }
}
