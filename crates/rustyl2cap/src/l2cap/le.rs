//! LE signaling: credit based channels, flow control credits and
//! connection parameter updates

use log::{debug, warn};

use super::channel::{L2capChannel, ModeState};
use super::constants::*;
use super::core::{le_refusal, L2capManager, Teardown};
use super::packet::L2capCommandHeader;
use super::registry::ConnId;
use super::service::{DisconnectReason, ServiceEvent};
use super::signaling::SignalingMessage;
use super::types::*;

impl L2capManager {
    /// Process one LE signaling frame; it carries exactly one command
    pub(crate) fn handle_le_signaling(&mut self, conn: ConnId, payload: &[u8]) {
        if payload.len() > self.settings.signaling_mtu as usize {
            let identifier = payload.get(1).copied().unwrap_or(0);
            let data = self.settings.signaling_mtu.to_le_bytes().to_vec();
            self.send_command_reject(conn, identifier, L2CAP_REJECT_SIGNALING_MTU_EXCEEDED, data);
            return;
        }
        let Some(header) = L2capCommandHeader::parse(payload) else {
            let identifier = payload.get(1).copied().unwrap_or(0);
            self.send_command_reject(conn, identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        };
        let params = &payload[L2CAP_COMMAND_HEADER_SIZE..];
        if header.length as usize != params.len() {
            warn!(
                "LE command 0x{:02X} declares {} bytes, frame carries {}",
                header.code,
                header.length,
                params.len()
            );
            self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        }
        if !SignalingMessage::is_allowed(header.code, true) {
            self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        }

        match SignalingMessage::parse_command(&header, params) {
            Ok(message) => self.dispatch_le(conn, message),
            Err(e) => {
                warn!("Malformed LE command 0x{:02X}: {}", header.code, e);
                if header.code != L2CAP_COMMAND_REJECT {
                    self.send_command_reject(conn, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                }
            }
        }
    }

    fn dispatch_le(&mut self, conn: ConnId, message: SignalingMessage) {
        debug!("RX LE signaling: {:?}", message);
        match message {
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data,
            } => self.handle_command_reject(conn, identifier, reason, &data),
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
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => {
                let remote = LeChannelConfig {
                    mtu,
                    mps,
                    initial_credits,
                };
                self.handle_le_connection_request(conn, identifier, le_psm, source_cid, remote)
            }
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => {
                let remote = LeChannelConfig {
                    mtu,
                    mps,
                    initial_credits,
                };
                self.handle_le_connection_response(conn, identifier, destination_cid, remote, result)
            }
            SignalingMessage::LeFlowControlCredit { cid, credits, .. } => self.handle_flow_control_credit(conn, cid, credits),
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } => {
                self.handle_connection_parameter_update_request(conn, identifier, params)
            }
            SignalingMessage::ConnectionParameterUpdateResponse { identifier, result } => {
                self.drop_pending(conn, identifier);
                let handle = self.registry.connection(conn).and_then(|c| c.handle);
                if let (Some(handler), Some(handle)) = (self.conn_param_handler.as_mut(), handle) {
                    handler.on_update_response(handle, result);
                }
            }
            other => debug!("Ignoring classic command on LE link: {:?}", other),
        }
    }

    pub(crate) fn send_le_connection_request(&mut self, conn: ConnId, lcid: u16) {
        let Some(channel) = self.registry.channel_mut(lcid) else {
            return;
        };
        channel.state = ChannelState::ConnectOutReq;
        let (le_psm, local) = (channel.remote_psm, channel.le_local);
        self.send_request(conn, Some(lcid), |identifier| {
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid: lcid,
                mtu: local.mtu,
                mps: local.mps,
                initial_credits: local.initial_credits,
            }
        });
    }

    fn handle_le_connection_request(
        &mut self,
        conn: ConnId,
        identifier: u8,
        psm: u16,
        scid: u16,
        remote: LeChannelConfig,
    ) {
        let Some(registration) = self.le_services.get(&psm) else {
            debug!("LE connection request for unregistered PSM 0x{:04X}", psm);
            self.send_signal(conn, le_refusal(identifier, L2CAP_LE_PSM_NOT_SUPPORTED));
            return;
        };
        let (config, key_policy) = (registration.config, registration.policy);
        if !remote.is_valid() {
            self.send_signal(conn, le_refusal(identifier, L2CAP_LE_UNACCEPTABLE_PARAMETERS));
            return;
        }
        if !(L2CAP_LE_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&scid) {
            self.send_signal(conn, le_refusal(identifier, L2CAP_LE_INVALID_SOURCE_CID));
            return;
        }
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        if connection.lcid_for_remote(scid).is_some() {
            self.send_signal(conn, le_refusal(identifier, L2CAP_LE_SOURCE_CID_ALREADY_ALLOCATED));
            return;
        }

        let Some(lcid) = self.registry.new_channel(conn, |lcid| {
            let mut channel = L2capChannel::new_le(lcid, psm, psm, config);
            channel.remote_cid = scid;
            channel.le_remote = remote;
            channel.state = ChannelState::ConnectInReq;
            channel.connect_identifier = identifier;
            channel
        }) else {
            self.send_signal(conn, le_refusal(identifier, L2CAP_LE_NO_RESOURCES));
            return;
        };
        self.cancel_linger(conn);
        debug!("Inbound LE channel 0x{:04X} for PSM 0x{:04X}", lcid, psm);

        if let Some(info) = self.connection_info(conn) {
            self.notify(
                lcid,
                ServiceEvent::LeConnectRequest {
                    identifier,
                    info,
                    remote,
                },
            );
        }
        if key_policy.auto_accept {
            self.answer_le_connection(conn, lcid, identifier, L2CAP_LE_CONNECTION_SUCCESSFUL);
        }
    }

    fn answer_le_connection(&mut self, conn: ConnId, lcid: u16, identifier: u8, result: u16) {
        let Some(local) = self.registry.channel(lcid).map(|c| c.le_local) else {
            return;
        };
        if result != L2CAP_LE_CONNECTION_SUCCESSFUL {
            self.send_signal(conn, le_refusal(identifier, result));
            self.delete_channel(conn, lcid, Teardown::Linger);
            return;
        }

        self.send_signal(
            conn,
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: lcid,
                mtu: local.mtu,
                mps: local.mps,
                initial_credits: local.initial_credits,
                result,
            },
        );
        self.enter_connected(lcid);
    }

    /// Answer an inbound LE connection request reported to a manual service
    pub fn le_connect_response(&mut self, lcid: u16, identifier: u8, result: u16) -> L2capResult<()> {
        let conn = self
            .registry
            .find_channel(lcid)
            .ok_or(L2capError::ChannelNotFound(lcid))?;
        let channel = self.registry.channel(lcid).ok_or(L2capError::ChannelNotFound(lcid))?;
        if !channel.is_le() {
            return Err(L2capError::NotSupported);
        }
        if channel.state != ChannelState::ConnectInReq {
            return Err(L2capError::InvalidState(channel.state));
        }

        self.answer_le_connection(conn, lcid, identifier, result);
        self.flush_events();
        Ok(())
    }

    fn handle_le_connection_response(
        &mut self,
        conn: ConnId,
        identifier: u8,
        dcid: u16,
        remote: LeChannelConfig,
        result: u16,
    ) {
        let Some(lcid) = self.drop_pending(conn, identifier).and_then(|r| r.lcid) else {
            debug!("Unsolicited LE connection response id {}", identifier);
            return;
        };
        let Some(channel) = self.registry.connection_mut(conn).and_then(|c| c.channel_mut(lcid)) else {
            return;
        };
        if channel.state != ChannelState::ConnectOutReq {
            debug!("Ignoring LE connection response for {}", channel);
            return;
        }

        if result == L2CAP_LE_CONNECTION_SUCCESSFUL {
            channel.remote_cid = dcid;
            let in_range = (L2CAP_LE_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&dcid);
            if !remote.is_valid() || !in_range {
                warn!(
                    "LE channel 0x{:04X}: peer answered with CID 0x{:04X} MTU {} MPS {}",
                    lcid, dcid, remote.mtu, remote.mps
                );
                self.local_disconnect(conn, lcid, Some(DisconnectReason::ProtocolError));
                return;
            }
            channel.le_remote = remote;
        }

        if let Some(info) = self.connection_info(conn) {
            self.notify(lcid, ServiceEvent::LeConnectResponse { info, result });
        }
        if result == L2CAP_LE_CONNECTION_SUCCESSFUL {
            self.enter_connected(lcid);
        } else {
            debug!("Peer refused LE channel 0x{:04X} with result 0x{:04X}", lcid, result);
            self.delete_channel(conn, lcid, Teardown::Immediate);
        }
    }

    fn handle_flow_control_credit(&mut self, conn: ConnId, rcid: u16, credits: u16) {
        let Some(connection) = self.registry.connection_mut(conn) else {
            return;
        };
        let Some(lcid) = connection.lcid_for_remote(rcid) else {
            debug!("Credits for unknown channel 0x{:04X}", rcid);
            return;
        };
        let Some(ModeState::Credit(engine)) = connection.channel_mut(lcid).map(|c| &mut c.mode) else {
            debug!("Credits for channel 0x{:04X} without credit flow control", lcid);
            return;
        };

        match engine.add_credits(credits) {
            Ok(()) => self.run_credit_actions(conn, lcid),
            Err(e) => {
                warn!("LE channel 0x{:04X}: {}", lcid, e);
                self.local_disconnect(conn, lcid, Some(DisconnectReason::ProtocolError));
            }
        }
    }

    /// Ask the master of LE link `handle` for new connection parameters
    pub fn connection_parameter_update(&mut self, handle: u16, params: ConnectionParameterUpdate) -> L2capResult<()> {
        let conn = self.connected_link(handle, ConnectionType::LE)?;
        if !params.validate() {
            return Err(L2capError::InvalidParameter(format!(
                "Connection parameters out of range: {:?}",
                params
            )));
        }
        if self.registry.connection(conn).map(|c| c.role) != Some(LeRole::Slave) {
            return Err(L2capError::NotSupported);
        }

        self.send_request(conn, None, |identifier| SignalingMessage::ConnectionParameterUpdateRequest {
            identifier,
            params,
        });
        self.flush_events();
        Ok(())
    }

    /// Answer a connection parameter update request the handler deferred
    pub fn connection_parameter_update_response(
        &mut self,
        handle: u16,
        identifier: u8,
        accepted: bool,
    ) -> L2capResult<()> {
        let conn = self.connected_link(handle, ConnectionType::LE)?;
        self.send_parameter_update_result(conn, identifier, accepted);
        self.flush_events();
        Ok(())
    }

    fn send_parameter_update_result(&mut self, conn: ConnId, identifier: u8, accepted: bool) {
        let result = if accepted {
            L2CAP_CONN_PARAM_ACCEPTED
        } else {
            L2CAP_CONN_PARAM_REJECTED
        };
        self.send_signal(
            conn,
            SignalingMessage::ConnectionParameterUpdateResponse { identifier, result },
        );
    }

    fn handle_connection_parameter_update_request(
        &mut self,
        conn: ConnId,
        identifier: u8,
        params: ConnectionParameterUpdate,
    ) {
        let Some(connection) = self.registry.connection(conn) else {
            return;
        };
        // Only the master may be asked
        if connection.role == LeRole::Slave {
            self.send_command_reject(conn, identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return;
        }
        let handle = connection.handle;
        if !params.validate() {
            debug!("Rejecting out of range connection parameters {:?}", params);
            self.send_parameter_update_result(conn, identifier, false);
            return;
        }

        let verdict = match (self.conn_param_handler.as_mut(), handle) {
            (Some(handler), Some(handle)) => handler.on_update_request(handle, identifier, &params),
            _ => Some(false),
        };
        match verdict {
            Some(accepted) => self.send_parameter_update_result(conn, identifier, accepted),
            None => debug!("Connection parameter update id {} deferred", identifier),
        }
    }
}
