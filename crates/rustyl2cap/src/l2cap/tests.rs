//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::packet::*;
    use super::super::signaling::*;
    use super::super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const A_ADDR: BdAddr = BdAddr {
        bytes: [0x0A, 0x00, 0x00, 0x00, 0x00, 0x0A],
    };
    const B_ADDR: BdAddr = BdAddr {
        bytes: [0x0B, 0x00, 0x00, 0x00, 0x00, 0x0B],
    };
    /// Handle of the link as seen by A and by B
    const HA: u16 = 0x0001;
    const HB: u16 = 0x0002;
    const TEST_PSM: PSM = PSM::Dynamic(0x1001);
    const TEST_LE_PSM: PSM = PSM::Dynamic(0x0081);

    #[derive(Debug, Default)]
    struct LinkLog {
        connects: Vec<(BdAddr, ConnectionType)>,
        disconnects: Vec<(u16, u8)>,
        sent: Vec<Vec<u8>>,
    }

    struct MockLink(Arc<Mutex<LinkLog>>);

    impl LinkLayer for MockLink {
        fn connect(&mut self, address: BdAddr, kind: ConnectionType) -> Result<(), crate::error::LinkError> {
            self.0.lock().unwrap().connects.push((address, kind));
            Ok(())
        }

        fn disconnect(&mut self, handle: u16, reason: u8) -> Result<(), crate::error::LinkError> {
            self.0.lock().unwrap().disconnects.push((handle, reason));
            Ok(())
        }

        fn send(&mut self, _handle: u16, _flush_timeout: u16, data: &[u8]) -> Result<(), crate::error::LinkError> {
            self.0.lock().unwrap().sent.push(data.to_vec());
            Ok(())
        }
    }

    type Armed = Arc<Mutex<BTreeMap<TimerId, Duration>>>;

    struct MockTimers(Armed);

    impl TimerScheduler for MockTimers {
        fn schedule(&mut self, id: TimerId, after: Duration) {
            self.0.lock().unwrap().insert(id, after);
        }

        fn cancel(&mut self, id: TimerId) {
            self.0.lock().unwrap().remove(&id);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        ConnectRequest(u16, u8),
        ConnectResponse(u16, u16),
        ConfigRequest(u16, u8, ChannelConfig),
        ConfigResponse(u16, ConfigResult),
        DisconnectRequest(u16),
        DisconnectResponse(u16),
        Data(u16, Vec<u8>),
        RemoteBusy(u16, bool),
        Abnormal(u16, DisconnectReason),
        Connected(u16),
        LeConnectRequest(u16, u8),
        LeConnectResponse(u16, u16),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    struct RecordingService(Events);

    impl RecordingService {
        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Service for RecordingService {
        fn on_connect_request(&mut self, lcid: u16, identifier: u8, _info: &ConnectionInfo, _remote_psm: u16) {
            self.push(Event::ConnectRequest(lcid, identifier));
        }

        fn on_connect_response(&mut self, lcid: u16, _info: &ConnectionInfo, result: u16, _status: u16) {
            self.push(Event::ConnectResponse(lcid, result));
        }

        fn on_config_request(&mut self, lcid: u16, identifier: u8, config: &ChannelConfig) {
            self.push(Event::ConfigRequest(lcid, identifier, *config));
        }

        fn on_config_response(&mut self, lcid: u16, result: ConfigResult, _config: &ChannelConfig) {
            self.push(Event::ConfigResponse(lcid, result));
        }

        fn on_disconnect_request(&mut self, lcid: u16, _identifier: u8) {
            self.push(Event::DisconnectRequest(lcid));
        }

        fn on_disconnect_response(&mut self, lcid: u16) {
            self.push(Event::DisconnectResponse(lcid));
        }

        fn on_data(&mut self, lcid: u16, data: &[u8]) {
            self.push(Event::Data(lcid, data.to_vec()));
        }

        fn on_remote_busy(&mut self, lcid: u16, busy: bool) {
            self.push(Event::RemoteBusy(lcid, busy));
        }

        fn on_disconnect_abnormal(&mut self, lcid: u16, reason: DisconnectReason) {
            self.push(Event::Abnormal(lcid, reason));
        }

        fn on_connected(&mut self, lcid: u16) {
            self.push(Event::Connected(lcid));
        }

        fn on_le_connect_request(&mut self, lcid: u16, identifier: u8, _info: &ConnectionInfo, _remote: &LeChannelConfig) {
            self.push(Event::LeConnectRequest(lcid, identifier));
        }

        fn on_le_connect_response(&mut self, lcid: u16, _info: &ConnectionInfo, result: u16) {
            self.push(Event::LeConnectResponse(lcid, result));
        }
    }

    /// Echo handler answering with the reversed payload
    struct Reflector(Arc<Mutex<Vec<(u16, Vec<u8>)>>>);

    impl EchoHandler for Reflector {
        fn on_echo_request(&mut self, _handle: u16, data: &[u8]) -> Vec<u8> {
            data.iter().rev().copied().collect()
        }

        fn on_echo_response(&mut self, handle: u16, data: &[u8]) {
            self.0.lock().unwrap().push((handle, data.to_vec()));
        }
    }

    /// Parameter handler with a fixed verdict that records responses
    struct ParameterPolicy {
        verdict: Option<bool>,
        requests: Arc<Mutex<Vec<u8>>>,
        responses: Arc<Mutex<Vec<u16>>>,
    }

    impl ConnectionParameterHandler for ParameterPolicy {
        fn on_update_request(&mut self, _handle: u16, identifier: u8, _params: &ConnectionParameterUpdate) -> Option<bool> {
            self.requests.lock().unwrap().push(identifier);
            self.verdict
        }

        fn on_update_response(&mut self, _handle: u16, result: u16) {
            self.responses.lock().unwrap().push(result);
        }
    }

    struct FixedRecorder(Arc<Mutex<Vec<(u16, u16, Vec<u8>)>>>);

    impl FixedChannelHandler for FixedRecorder {
        fn on_data(&mut self, handle: u16, cid: u16, data: &[u8]) {
            self.0.lock().unwrap().push((handle, cid, data.to_vec()));
        }
    }

    /// One engine with its mocks
    struct Side {
        manager: L2capManager,
        link: Arc<Mutex<LinkLog>>,
        timers: Armed,
        events: Events,
    }

    impl Side {
        fn new(settings: EngineSettings) -> Self {
            let link = Arc::new(Mutex::new(LinkLog::default()));
            let timers = Armed::default();
            let manager = L2capManager::new(
                settings,
                Box::new(MockLink(Arc::clone(&link))),
                Box::new(MockTimers(Arc::clone(&timers))),
            );
            Self {
                manager,
                link,
                timers,
                events: Events::default(),
            }
        }

        fn register(&mut self, policy: ConnectionPolicy, config: ChannelConfig) {
            let service = RecordingService(Arc::clone(&self.events));
            self.manager
                .register_with_config(TEST_PSM, Box::new(service), policy, config)
                .unwrap();
        }

        fn register_le(&mut self, policy: ConnectionPolicy, config: LeChannelConfig) {
            let service = RecordingService(Arc::clone(&self.events));
            self.manager
                .register_le_with_config(TEST_LE_PSM, Box::new(service), policy, config)
                .unwrap();
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn take_sent(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.link.lock().unwrap().sent)
        }

        fn disconnects(&self) -> Vec<(u16, u8)> {
            self.link.lock().unwrap().disconnects.clone()
        }

        fn armed(&self, matches: impl Fn(&TimerId) -> bool) -> Vec<(TimerId, Duration)> {
            self.timers
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| matches(id))
                .map(|(id, after)| (*id, *after))
                .collect()
        }

        /// Expire the first armed timer accepted by `matches`
        fn fire(&mut self, matches: impl Fn(&TimerId) -> bool) -> bool {
            let id = self.timers.lock().unwrap().keys().copied().find(|id| matches(id));
            match id {
                Some(id) => {
                    self.timers.lock().unwrap().remove(&id);
                    self.manager.handle_timeout(id);
                    true
                }
                None => false,
            }
        }

        fn data(&self, lcid: u16) -> Vec<Vec<u8>> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Data(cid, data) if cid == lcid => Some(data),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Direction {
        AtoB,
        BtoA,
    }

    /// Two engines wired back to back
    struct Pair {
        a: Side,
        b: Side,
    }

    impl Pair {
        fn new() -> Self {
            Self::with_settings(EngineSettings::default())
        }

        fn with_settings(settings: EngineSettings) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self {
                a: Side::new(settings.clone()),
                b: Side::new(settings),
            }
        }

        fn link_up(&mut self, kind: ConnectionType) {
            self.b.manager.link_up(A_ADDR, HB, kind, LeRole::Slave, 0);
            self.a.manager.link_up(B_ADDR, HA, kind, LeRole::Master, 0);
        }

        fn pump(&mut self) {
            self.pump_with(|_, frames| frames);
        }

        /// Exchange frames until both sides are quiet; `filter` may drop,
        /// reorder or duplicate each batch in flight
        fn pump_with(&mut self, mut filter: impl FnMut(Direction, Vec<Vec<u8>>) -> Vec<Vec<u8>>) {
            for _ in 0..10_000 {
                let from_a = self.a.take_sent();
                let a_moved = !from_a.is_empty();
                for frame in filter(Direction::AtoB, from_a) {
                    self.b.manager.receive(HB, &frame);
                }

                let from_b = self.b.take_sent();
                let b_moved = !from_b.is_empty();
                for frame in filter(Direction::BtoA, from_b) {
                    self.a.manager.receive(HA, &frame);
                }

                if !a_moved && !b_moved {
                    return;
                }
            }
            panic!("frame exchange did not settle");
        }

        /// Open a classic channel from A to B; returns (A's CID, B's CID)
        fn open_classic(&mut self) -> (u16, u16) {
            let lcid = self.a.manager.open(B_ADDR, TEST_PSM, TEST_PSM, None).unwrap();
            self.link_up(ConnectionType::Classic);
            self.pump();
            let rcid = self.a.manager.channel(lcid).map(L2capChannel::remote_cid).unwrap();
            (lcid, rcid)
        }

        fn open_le(&mut self) -> (u16, u16) {
            let lcid = self.a.manager.open_le(B_ADDR, TEST_LE_PSM, TEST_LE_PSM, None).unwrap();
            self.link_up(ConnectionType::LE);
            self.pump();
            let rcid = self.a.manager.channel(lcid).map(L2capChannel::remote_cid).unwrap();
            (lcid, rcid)
        }
    }

    fn auto() -> ConnectionPolicy {
        ConnectionPolicy::default()
    }

    fn manual() -> ConnectionPolicy {
        ConnectionPolicy { auto_accept: false }
    }

    fn ertm(window: u8) -> ChannelConfig {
        let mut config = EngineSettings::default().channel_config(RetransmissionMode::EnhancedRetransmission);
        config.rfc.tx_window_size = window;
        config
    }

    fn le_config(mtu: u16, mps: u16, credits: u16) -> LeChannelConfig {
        LeChannelConfig {
            mtu,
            mps,
            initial_credits: credits,
        }
    }

    /// Decode a signaling frame
    fn signal(frame: &[u8]) -> Option<SignalingMessage> {
        let packet = L2capPacket::parse(frame)?;
        match packet.header.channel_id {
            L2CAP_SIGNALING_CID => SignalingMessage::parse(&packet.payload, false).ok(),
            L2CAP_LE_SIGNALING_CID => SignalingMessage::parse(&packet.payload, true).ok(),
            _ => None,
        }
    }

    fn signals(frames: &[Vec<u8>]) -> Vec<SignalingMessage> {
        frames.iter().filter_map(|f| signal(f)).collect()
    }

    fn channel_id(frame: &[u8]) -> u16 {
        u16::from_le_bytes([frame[2], frame[3]])
    }

    fn is_i_frame(frame: &[u8]) -> bool {
        frame.len() >= 6 && channel_id(frame) >= L2CAP_DYNAMIC_CID_MIN && frame[4] & 0x01 == 0
    }

    fn classic_signal(message: SignalingMessage) -> Vec<u8> {
        message.to_packet(false).to_bytes()
    }

    /// Identifier of the configuration request `side` still waits on
    fn pending_config(side: &Side, handle: u16) -> u8 {
        side.manager
            .connection(handle)
            .unwrap()
            .pending()
            .iter()
            .find(|p| p.code == L2CAP_CONFIGURE_REQUEST)
            .map(|p| p.identifier)
            .unwrap()
    }

    /// Answer B's outstanding configuration request with `result`
    fn answer_b_config(pair: &mut Pair, b_cid: u16, result: ConfigResult, options: Vec<u8>) -> Vec<SignalingMessage> {
        let response = SignalingMessage::ConfigureResponse {
            identifier: pending_config(&pair.b, HB),
            source_cid: b_cid,
            flags: 0,
            result: result.value(),
            options,
        };
        pair.b.manager.receive(HB, &classic_signal(response));
        signals(&pair.b.take_sent())
    }

    fn request_options(sent: &[SignalingMessage]) -> ConfigOptions {
        match sent {
            [SignalingMessage::ConfigureRequest { options, .. }] => parse_config_options(options).unwrap().options,
            other => panic!("expected one configuration request, got {:?}", other),
        }
    }

    #[test]
    fn test_open_send_close() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());

        let (a_cid, b_cid) = pair.open_classic();
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Connected));
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Connected));
        assert!(pair.a.events().contains(&Event::Connected(a_cid)));
        assert!(pair
            .b
            .events()
            .iter()
            .any(|e| matches!(e, Event::ConnectRequest(cid, _) if *cid == b_cid)));
        assert_eq!(pair.a.link.lock().unwrap().connects, vec![(B_ADDR, ConnectionType::Classic)]);

        // Discovery finished on both links
        let connection = pair.a.manager.connection(HA).unwrap();
        assert_eq!(connection.info_state(), InfoState::Done);
        assert_ne!(connection.extended_features() & L2CAP_FEATURE_ENHANCED_RETRANSMISSION, 0);
        assert_eq!(connection.fixed_channels(), L2CAP_FIXED_CHANNEL_SIGNALING);

        pair.a.manager.send(a_cid, b"hello").unwrap();
        pair.b.manager.send(b_cid, b"world").unwrap();
        pair.pump();
        assert_eq!(pair.b.data(b_cid), vec![b"hello".to_vec()]);
        assert_eq!(pair.a.data(a_cid), vec![b"world".to_vec()]);

        // SDUs above the peer's MTU are refused locally
        assert!(matches!(
            pair.a.manager.send(a_cid, &[0u8; 673]),
            Err(L2capError::MtuExceeded { size: 673, mtu: 672 })
        ));

        pair.a.manager.close(a_cid).unwrap();
        pair.pump();
        assert!(pair.a.manager.channel(a_cid).is_none());
        assert!(pair.b.manager.channel(b_cid).is_none());
        assert!(pair.a.events().contains(&Event::DisconnectResponse(a_cid)));
        assert!(pair.b.events().contains(&Event::DisconnectRequest(b_cid)));

        // The idle link lingers, then goes down
        assert_eq!(
            pair.a.armed(|id| matches!(id, TimerId::Linger { .. })),
            vec![(TimerId::Linger { handle: HA }, Duration::from_secs(2))]
        );
        assert!(pair.a.disconnects().is_empty());
        assert!(pair.a.fire(|id| matches!(id, TimerId::Linger { .. })));
        assert_eq!(pair.a.disconnects(), vec![(HA, HCI_REMOTE_USER_TERMINATED)]);
    }

    #[test]
    fn test_unregistered_psm_refused() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());

        let a_cid = pair.a.manager.open(B_ADDR, TEST_PSM, TEST_PSM, None).unwrap();
        pair.link_up(ConnectionType::Classic);
        pair.pump();
        assert!(pair
            .a
            .events()
            .contains(&Event::ConnectResponse(a_cid, L2CAP_CONNECTION_PSM_NOT_SUPPORTED)));
        assert!(pair.a.manager.channel(a_cid).is_none());
        // Last channel refused: link dropped at once
        assert_eq!(pair.a.disconnects(), vec![(HA, HCI_REMOTE_USER_TERMINATED)]);
    }

    #[test]
    fn test_mtu_converges_in_one_round() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::basic(672));
        pair.b.register(auto(), ChannelConfig::basic(200));

        let (a_cid, b_cid) = pair.open_classic();
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Connected));
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Connected));

        let unacceptable = pair
            .a
            .events()
            .into_iter()
            .filter(|e| *e == Event::ConfigResponse(a_cid, ConfigResult::UnacceptableParameters))
            .count();
        assert_eq!(unacceptable, 1);

        let channel = pair.a.manager.channel(a_cid).unwrap();
        assert_eq!(channel.local_config().mtu, 200);
        assert_eq!(channel.remote_config().mtu, 200);
        assert_eq!(pair.b.manager.channel(b_cid).unwrap().remote_config().mtu, 200);
    }

    #[test]
    fn test_mode_converges_to_simpler_side() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ertm(8));
        pair.b.register(auto(), ChannelConfig::basic(672));

        let (a_cid, b_cid) = pair.open_classic();
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Connected));
        assert!(matches!(pair.a.manager.channel(a_cid).unwrap().mode(), ModeState::Basic));
        assert!(matches!(pair.b.manager.channel(b_cid).unwrap().mode(), ModeState::Basic));

        pair.a.manager.send(a_cid, b"basic").unwrap();
        pair.pump();
        assert_eq!(pair.b.data(b_cid), vec![b"basic".to_vec()]);
    }

    #[test]
    fn test_ertm_recovers_lost_frame_in_order() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ertm(8));
        pair.b.register(auto(), ertm(8));

        let (a_cid, b_cid) = pair.open_classic();
        let ModeState::Erfc(engine) = pair.a.manager.channel(a_cid).unwrap().mode() else {
            panic!("expected enhanced retransmission");
        };
        assert_eq!(engine.params().tx_window, 8);
        assert_eq!(engine.params().retransmission_timeout, Duration::from_millis(2000));

        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 10]).collect();
        for payload in &payloads {
            pair.a.manager.send(a_cid, payload).unwrap();
        }

        // Lose the fifth I-frame on its first transmission
        let mut i_frames = 0;
        pair.pump_with(|direction, frames| {
            frames
                .into_iter()
                .filter(|frame| {
                    if direction == Direction::AtoB && is_i_frame(frame) {
                        i_frames += 1;
                        return i_frames != 5;
                    }
                    true
                })
                .collect()
        });

        assert_eq!(pair.b.data(b_cid), payloads);
        assert!(i_frames > 20, "frames from #5 on were sent again");
    }

    #[test]
    fn test_ertm_reorder_and_duplicate_property() {
        // Unlimited transmissions: a frame may be rewound many times
        let mut config = ertm(8);
        config.rfc.max_transmit = 0;
        for seed in 0..8u64 {
            let mut pair = Pair::new();
            pair.a.register(auto(), config);
            pair.b.register(auto(), config);
            let (a_cid, b_cid) = pair.open_classic();

            let payloads: Vec<Vec<u8>> = (0..30u8).map(|i| vec![i; 1 + i as usize]).collect();
            for payload in &payloads {
                pair.a.manager.send(a_cid, payload).unwrap();
            }

            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..50 {
                pair.pump_with(|direction, mut frames| {
                    if direction == Direction::BtoA {
                        return frames;
                    }
                    let mut out = Vec::with_capacity(frames.len());
                    while !frames.is_empty() {
                        let frame = frames.remove(0);
                        if !is_i_frame(&frame) {
                            out.push(frame);
                            continue;
                        }
                        if !frames.is_empty() && rng.gen_bool(0.2) {
                            // Swap with the next frame
                            out.push(frames.remove(0));
                        }
                        if rng.gen_bool(0.1) {
                            out.push(frame.clone());
                        }
                        out.push(frame);
                    }
                    out
                });
                if pair.b.data(b_cid).len() == payloads.len() {
                    break;
                }
                // Stalled: let the retransmission or monitor timer run
                pair.a
                    .fire(|id| matches!(id, TimerId::Retransmission { .. } | TimerId::Monitor { .. }));
            }

            assert_eq!(pair.b.data(b_cid), payloads, "seed {}", seed);
        }
    }

    #[test]
    fn test_corrupted_frame_dropped_then_retransmitted() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ertm(8));
        pair.b.register(auto(), ertm(8));
        let (a_cid, b_cid) = pair.open_classic();

        pair.a.manager.send(a_cid, b"payload").unwrap();
        let mut frames = pair.a.take_sent();
        assert_eq!(frames.len(), 1);
        let last = frames[0].len() - 1;
        frames[0][last] ^= 0xFF;
        pair.b.manager.receive(HB, &frames[0]);

        // Silent drop: nothing delivered, nothing answered
        assert!(pair.b.data(b_cid).is_empty());
        assert!(pair.b.take_sent().is_empty());

        assert!(pair.a.fire(|id| *id == TimerId::Retransmission { lcid: a_cid }));
        pair.pump();
        assert_eq!(pair.b.data(b_cid), vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_local_busy_holds_peer() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ertm(8));
        pair.b.register(auto(), ertm(8));
        let (a_cid, b_cid) = pair.open_classic();

        // B enters local busy: A is told with RNR
        pair.b.manager.set_local_busy(b_cid, true).unwrap();
        let sent = pair.b.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][4] & 0x01, 0x01);
        assert_eq!((sent[0][4] >> 2) & 0x03, 0x02);
        pair.a.manager.receive(HA, &sent[0]);
        assert!(pair.a.events().contains(&Event::RemoteBusy(a_cid, true)));

        // Held while the peer is busy
        pair.a.manager.send(a_cid, b"held").unwrap();
        assert!(!pair.a.take_sent().iter().any(|f| is_i_frame(f)));

        pair.b.manager.set_local_busy(b_cid, false).unwrap();
        pair.pump();
        assert_eq!(pair.b.data(b_cid), vec![b"held".to_vec()]);

        // Basic mode channels have no busy state
        let mut basic = Pair::new();
        basic.a.register(auto(), ChannelConfig::default());
        basic.b.register(auto(), ChannelConfig::default());
        let (lcid, _) = basic.open_classic();
        assert!(matches!(basic.a.manager.set_local_busy(lcid, true), Err(L2capError::NotSupported)));
    }

    #[test]
    fn test_le_credits_limit_transmission() {
        let mut pair = Pair::new();
        pair.a.register_le(auto(), le_config(100, 100, 8));
        pair.b.register_le(auto(), le_config(512, 100, 8));

        let (a_cid, b_cid) = pair.open_le();
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Connected));
        assert!(pair
            .b
            .events()
            .iter()
            .any(|e| matches!(e, Event::LeConnectRequest(cid, _) if *cid == b_cid)));
        assert!(pair
            .a
            .events()
            .contains(&Event::LeConnectResponse(a_cid, L2CAP_LE_CONNECTION_SUCCESSFUL)));

        // 250 bytes plus the SDU length span three 100 byte PDUs
        pair.a.manager.send(a_cid, &[0x55; 250]).unwrap();
        assert_eq!(pair.a.manager.channel(a_cid).unwrap().tx_credits(), Some(5));

        for i in 0..8u8 {
            pair.a.manager.send(a_cid, &[i; 50]).unwrap();
        }
        let sent = pair.a.take_sent();
        let pdus = sent.iter().filter(|f| channel_id(f) == b_cid).count();
        assert_eq!(pdus, 8);
        assert_eq!(pair.a.manager.channel(a_cid).unwrap().tx_credits(), Some(0));
        assert!(pair.a.events().contains(&Event::RemoteBusy(a_cid, true)));

        for frame in sent {
            pair.b.manager.receive(HB, &frame);
        }
        pair.pump();

        let mut expected = vec![vec![0x55; 250]];
        expected.extend((0..8u8).map(|i| vec![i; 50]));
        assert_eq!(pair.b.data(b_cid), expected);
        assert!(pair.a.events().contains(&Event::RemoteBusy(a_cid, false)));
    }

    #[test]
    fn test_le_credit_overflow_disconnects() {
        let mut pair = Pair::new();
        pair.a.register_le(auto(), le_config(100, 100, 8));
        pair.b.register_le(auto(), le_config(512, 100, 8));
        let (a_cid, b_cid) = pair.open_le();

        let grant = SignalingMessage::LeFlowControlCredit {
            identifier: 0x77,
            cid: b_cid,
            credits: 0xFFFF,
        };
        pair.a.manager.receive(HA, &grant.to_packet(true).to_bytes());
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::DisconnectOutReq));

        pair.pump();
        assert!(pair.a.manager.channel(a_cid).is_none());
        assert!(pair.b.manager.channel(b_cid).is_none());

        let events = pair.a.events();
        let reports = events
            .iter()
            .filter(|e| **e == Event::Abnormal(a_cid, DisconnectReason::ProtocolError))
            .count();
        assert_eq!(reports, 1);
        assert!(!events.contains(&Event::DisconnectResponse(a_cid)));
    }

    #[test]
    fn test_le_pdu_without_credit_disconnects() {
        let mut pair = Pair::new();
        pair.a.register_le(auto(), le_config(100, 100, 0));
        pair.b.register_le(auto(), le_config(512, 100, 8));
        let (a_cid, _) = pair.open_le();

        let pdu = L2capPacket::new(a_cid, vec![3, 0, 1, 2, 3]).to_bytes();
        pair.a.manager.receive(HA, &pdu);

        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::DisconnectOutReq));
        assert!(pair.a.data(a_cid).is_empty());
        assert!(pair
            .a
            .events()
            .contains(&Event::Abnormal(a_cid, DisconnectReason::ProtocolError)));
    }

    #[test]
    fn test_le_unregistered_psm_refused() {
        let mut pair = Pair::new();
        pair.a.register_le(auto(), le_config(100, 100, 8));

        let lcid = pair.a.manager.open_le(B_ADDR, TEST_LE_PSM, TEST_LE_PSM, None).unwrap();
        pair.link_up(ConnectionType::LE);
        pair.pump();

        assert!(pair
            .a
            .events()
            .contains(&Event::LeConnectResponse(lcid, L2CAP_LE_PSM_NOT_SUPPORTED)));
        assert!(pair.a.manager.channel(lcid).is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (a_cid, _) = pair.open_classic();

        pair.a.manager.close(a_cid).unwrap();
        assert!(matches!(
            pair.a.manager.close(a_cid),
            Err(L2capError::InvalidParameter(_))
        ));
        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::DisconnectOutReq));

        pair.pump();
        assert!(matches!(
            pair.a.manager.close(a_cid),
            Err(L2capError::InvalidParameter(_))
        ));
        let responses = pair
            .a
            .events()
            .into_iter()
            .filter(|e| *e == Event::DisconnectResponse(a_cid))
            .count();
        assert_eq!(responses, 1);
    }

    #[test]
    fn test_malformed_signaling_rejected() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (_, b_cid) = pair.open_classic();

        // Connection request declaring 16 parameter bytes, carrying one
        let truncated = L2capPacket::new(L2CAP_SIGNALING_CID, vec![0x02, 0x05, 0x10, 0x00, 0x01]).to_bytes();
        pair.b.manager.receive(HB, &truncated);
        assert_eq!(
            signals(&pair.b.take_sent()),
            vec![SignalingMessage::CommandReject {
                identifier: 0x05,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: vec![],
            }]
        );

        // Oversized frame: reject carries our signaling MTU
        let mut oversized = vec![L2CAP_ECHO_REQUEST, 0x06];
        oversized.extend_from_slice(&696u16.to_le_bytes());
        oversized.extend_from_slice(&[0u8; 696]);
        pair.b
            .manager
            .receive(HB, &L2capPacket::new(L2CAP_SIGNALING_CID, oversized).to_bytes());
        assert_eq!(
            signals(&pair.b.take_sent()),
            vec![SignalingMessage::CommandReject {
                identifier: 0x06,
                reason: L2CAP_REJECT_SIGNALING_MTU_EXCEEDED,
                data: 672u16.to_le_bytes().to_vec(),
            }]
        );

        // LE-only command on the classic channel
        let le_only = L2capPacket::new(L2CAP_SIGNALING_CID, vec![L2CAP_LE_FLOW_CONTROL_CREDIT, 0x07, 0x04, 0x00, 0x40, 0x00, 0x01, 0x00]).to_bytes();
        pair.b.manager.receive(HB, &le_only);
        assert!(matches!(
            signals(&pair.b.take_sent()).as_slice(),
            [SignalingMessage::CommandReject { identifier: 0x07, .. }]
        ));

        // A reject too short to parse is never answered
        let short_reject = L2capPacket::new(L2CAP_SIGNALING_CID, vec![L2CAP_COMMAND_REJECT, 0x08, 0x01, 0x00, 0x00]).to_bytes();
        pair.b.manager.receive(HB, &short_reject);
        assert!(pair.b.take_sent().is_empty());

        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Connected));
    }

    #[test]
    fn test_unknown_options_listed_verbatim() {
        let mut pair = Pair::new();
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (a_cid, b_cid) = pair.open_classic();
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Configuring));

        let request = SignalingMessage::ConfigureRequest {
            identifier: 0x42,
            destination_cid: b_cid,
            flags: 0,
            options: vec![0x10, 0x01, 0xAA, 0x90, 0x01, 0xBB],
        };
        pair.b.manager.receive(HB, &classic_signal(request));
        assert_eq!(
            signals(&pair.b.take_sent()),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 0x42,
                source_cid: a_cid,
                flags: 0,
                result: ConfigResult::UnknownOptions.value(),
                options: vec![0x10, 0x01, 0xAA],
            }]
        );
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Configuring));

        // MTU option of the wrong length
        let request = SignalingMessage::ConfigureRequest {
            identifier: 0x43,
            destination_cid: b_cid,
            flags: 0,
            options: vec![L2CAP_CONF_MTU, 0x03, 0x00, 0x02, 0x00],
        };
        pair.b.manager.receive(HB, &classic_signal(request));
        assert!(matches!(
            signals(&pair.b.take_sent()).as_slice(),
            [SignalingMessage::ConfigureResponse { identifier: 0x43, result: 0x0002, .. }]
        ));
    }

    #[test]
    fn test_unknown_options_response_reoffers() {
        let mut pair = Pair::new();
        let mut config = ertm(8);
        config.fcs = false;
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), config);
        let (_, b_cid) = pair.open_classic();

        // FCS dropped, RFC kept
        let sent = answer_b_config(&mut pair, b_cid, ConfigResult::UnknownOptions, vec![L2CAP_CONF_FCS, 0x01, 0x00]);
        let options = request_options(&sent);
        assert_eq!(options.fcs, None);
        assert_eq!(
            options.retransmission.map(|rfc| rfc.mode),
            Some(RetransmissionMode::EnhancedRetransmission)
        );
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Configuring));
        assert!(pair
            .b
            .events()
            .contains(&Event::ConfigResponse(b_cid, ConfigResult::UnknownOptions)));

        // RFC dropped: falls back to basic mode
        let mut rfc = vec![L2CAP_CONF_RFC, L2CAP_CONF_RFC_SIZE];
        rfc.extend_from_slice(&[0u8; 9]);
        let options = request_options(&answer_b_config(&mut pair, b_cid, ConfigResult::UnknownOptions, rfc));
        assert_eq!(options.retransmission, None);
        assert!(options.mtu.is_some());
        assert_eq!(
            pair.b.manager.channel(b_cid).unwrap().local_config().rfc.mode,
            RetransmissionMode::Basic
        );

        // Third re-offer is the last one
        let sent = answer_b_config(&mut pair, b_cid, ConfigResult::UnknownOptions, vec![0x10, 0x01, 0x00]);
        request_options(&sent);
        let sent = answer_b_config(&mut pair, b_cid, ConfigResult::UnknownOptions, vec![0x10, 0x01, 0x00]);
        assert!(matches!(sent.as_slice(), [SignalingMessage::DisconnectionRequest { .. }]));
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::DisconnectOutReq));
    }

    #[test]
    fn test_refused_configuration_response() {
        for result in [ConfigResult::Rejected, ConfigResult::FlowSpecRejected] {
            let mut pair = Pair::new();
            pair.a.register(manual(), ChannelConfig::default());
            pair.b.register(auto(), ChannelConfig::default());
            let (a_cid, b_cid) = pair.open_classic();

            // Auto service gives up on the channel
            let sent = answer_b_config(&mut pair, b_cid, result, Vec::new());
            assert!(matches!(
                sent.as_slice(),
                [SignalingMessage::DisconnectionRequest { destination_cid, source_cid, .. }]
                    if *destination_cid == a_cid && *source_cid == b_cid
            ));
            assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::DisconnectOutReq));
            assert!(pair.b.events().contains(&Event::ConfigResponse(b_cid, result)));

            // Manual service is only told
            let mut pair = Pair::new();
            pair.a.register(manual(), ChannelConfig::default());
            pair.b.register(auto(), ChannelConfig::default());
            let (a_cid, b_cid) = pair.open_classic();
            pair.a.manager.configure(a_cid, ChannelConfig::default()).unwrap();
            pair.a.take_sent();
            let response = SignalingMessage::ConfigureResponse {
                identifier: pending_config(&pair.a, HA),
                source_cid: a_cid,
                flags: 0,
                result: result.value(),
                options: Vec::new(),
            };
            pair.a.manager.receive(HA, &classic_signal(response));
            assert!(pair.a.take_sent().is_empty());
            assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Configuring));
            assert!(pair.a.events().contains(&Event::ConfigResponse(a_cid, result)));
            assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Configuring));
        }
    }

    #[test]
    fn test_tiny_mps_countered() {
        let mut pair = Pair::new();
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), ertm(8));
        let (_, b_cid) = pair.open_classic();

        let options = ConfigOptions {
            retransmission: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: 8,
                max_transmit: 3,
                retransmission_timeout: 0,
                monitor_timeout: 0,
                mps: 2,
            }),
            ..ConfigOptions::default()
        };
        let request = SignalingMessage::ConfigureRequest {
            identifier: 0x44,
            destination_cid: b_cid,
            flags: 0,
            options: serialize_config_options(&options),
        };
        pair.b.manager.receive(HB, &classic_signal(request));

        let sent = signals(&pair.b.take_sent());
        let [SignalingMessage::ConfigureResponse { identifier: 0x44, result, options, .. }] = sent.as_slice() else {
            panic!("expected a configuration response, got {:?}", sent);
        };
        assert_eq!(*result, ConfigResult::UnacceptableParameters.value());
        let suggested = parse_config_options(options).unwrap().options.retransmission.unwrap();
        assert_eq!(suggested.mode, RetransmissionMode::EnhancedRetransmission);
        assert_eq!(suggested.mps, 1010);
    }

    #[test]
    fn test_manual_service_answers_configuration() {
        let mut pair = Pair::new();
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (a_cid, b_cid) = pair.open_classic();

        let identifier = pair
            .a
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::ConfigRequest(cid, identifier, config) if cid == a_cid => {
                    assert_eq!(config.mtu, 672);
                    Some(identifier)
                }
                _ => None,
            })
            .unwrap();
        pair.a
            .manager
            .config_response(a_cid, identifier, ConfigResult::Success, ConfigOptions::default())
            .unwrap();
        pair.a.manager.configure(a_cid, ChannelConfig::basic(300)).unwrap();
        pair.pump();

        assert_eq!(pair.a.manager.channel_state(a_cid), Some(ChannelState::Connected));
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Connected));
        assert_eq!(pair.b.manager.channel(b_cid).unwrap().remote_config().mtu, 300);
    }

    #[test]
    fn test_fragmented_configuration_request() {
        let mut pair = Pair::new();
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (a_cid, b_cid) = pair.open_classic();

        let first = SignalingMessage::ConfigureRequest {
            identifier: 0x50,
            destination_cid: b_cid,
            flags: L2CAP_CONF_FLAG_CONTINUATION,
            options: vec![L2CAP_CONF_MTU, 0x02, 0x00, 0x02],
        };
        pair.b.manager.receive(HB, &classic_signal(first));
        assert_eq!(
            signals(&pair.b.take_sent()),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 0x50,
                source_cid: a_cid,
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                result: 0,
                options: vec![],
            }]
        );

        let last = SignalingMessage::ConfigureRequest {
            identifier: 0x51,
            destination_cid: b_cid,
            flags: 0,
            options: vec![L2CAP_CONF_FLUSH_TIMEOUT, 0x02, 0x10, 0x00],
        };
        pair.b.manager.receive(HB, &classic_signal(last));
        assert!(matches!(
            signals(&pair.b.take_sent()).as_slice(),
            [SignalingMessage::ConfigureResponse { identifier: 0x51, flags: 0, result: 0, .. }]
        ));
        let remote = *pair.b.manager.channel(b_cid).unwrap().remote_config();
        assert_eq!(remote.mtu, 512);
        assert_eq!(remote.flush_timeout, 0x0010);
    }

    #[test]
    fn test_configuration_fragments_over_limit() {
        let mut pair = Pair::new();
        pair.a.register(manual(), ChannelConfig::default());
        pair.b.register(auto(), ChannelConfig::default());
        let (_, b_cid) = pair.open_classic();

        for identifier in [0x60, 0x61] {
            let fragment = SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: b_cid,
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                options: vec![0u8; 400],
            };
            pair.b.manager.receive(HB, &classic_signal(fragment));
        }
        let replies = signals(&pair.b.take_sent());
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1],
            SignalingMessage::CommandReject {
                identifier: 0x61,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: vec![],
            }
        );
        assert_eq!(pair.b.manager.channel_state(b_cid), Some(ChannelState::Configuring));
    }

    #[test]
    fn test_pending_response_extends_then_times_out() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());
        pair.b.register(manual(), ChannelConfig::default());

        let lcid = pair.a.manager.open(B_ADDR, TEST_PSM, TEST_PSM, None).unwrap();
        pair.link_up(ConnectionType::Classic);
        pair.pump();
        assert!(pair
            .a
            .events()
            .contains(&Event::ConnectResponse(lcid, L2CAP_CONNECTION_PENDING)));
        assert_eq!(pair.a.manager.channel_state(lcid), Some(ChannelState::ConnectOutReq));

        // The pending answer moved the request onto ERTX
        let timers = pair.a.armed(|id| matches!(id, TimerId::Response { .. }));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].1, Duration::from_secs(300));

        assert!(pair.a.fire(|id| matches!(id, TimerId::Response { .. })));
        assert!(pair.a.manager.channel(lcid).is_none());
        assert!(pair.a.events().contains(&Event::Abnormal(lcid, DisconnectReason::Timeout)));
        assert_eq!(pair.a.disconnects(), vec![(HA, HCI_REMOTE_USER_TERMINATED)]);
    }

    #[test]
    fn test_information_timeout_drops_link() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());

        let lcid = pair.a.manager.open(B_ADDR, TEST_PSM, TEST_PSM, None).unwrap();
        pair.a.manager.link_up(B_ADDR, HA, ConnectionType::Classic, LeRole::Master, 0);
        let sent = signals(&pair.a.take_sent());
        assert!(matches!(
            sent.as_slice(),
            [SignalingMessage::InformationRequest {
                info_type: L2CAP_INFO_EXTENDED_FEATURES,
                ..
            }]
        ));

        let timers = pair.a.armed(|id| matches!(id, TimerId::Response { .. }));
        assert_eq!(timers[0].1, Duration::from_secs(60));
        assert!(pair.a.fire(|id| matches!(id, TimerId::Response { .. })));
        assert_eq!(pair.a.disconnects(), vec![(HA, HCI_REMOTE_USER_TERMINATED)]);

        pair.a.manager.link_down(HA, 0, 0x16);
        assert_eq!(
            pair.a.events(),
            vec![Event::Abnormal(lcid, DisconnectReason::LinkLoss(0x16))]
        );
        assert!(pair.a.manager.connection(HA).is_none());
    }

    #[test]
    fn test_link_connect_failure_reports_status() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ChannelConfig::default());

        let lcid = pair.a.manager.open(B_ADDR, TEST_PSM, TEST_PSM, None).unwrap();
        pair.a.manager.link_up(B_ADDR, 0, ConnectionType::Classic, LeRole::Master, 0x04);
        assert_eq!(
            pair.a.events(),
            vec![Event::Abnormal(lcid, DisconnectReason::ConnectFailed(0x04))]
        );
        assert!(pair.a.manager.channel(lcid).is_none());
    }

    #[test]
    fn test_link_loss_releases_channels() {
        let mut pair = Pair::new();
        pair.a.register(auto(), ertm(8));
        pair.b.register(auto(), ertm(8));
        let (a_cid, _) = pair.open_classic();

        pair.a.manager.send(a_cid, b"in flight").unwrap();
        pair.a.take_sent();
        assert!(!pair.a.armed(|id| matches!(id, TimerId::Retransmission { .. })).is_empty());

        pair.a.manager.link_down(HA, 0, 0x08);
        assert!(pair.a.events().contains(&Event::Abnormal(a_cid, DisconnectReason::LinkLoss(0x08))));
        assert!(pair.a.manager.channel(a_cid).is_none());
        assert!(pair.a.armed(|_| true).is_empty());
        assert!(matches!(pair.a.manager.send(a_cid, b"late"), Err(L2capError::ChannelNotFound(_))));
    }

    #[test]
    fn test_echo_round_trip() {
        let mut pair = Pair::new();
        let responses = Arc::new(Mutex::new(Vec::new()));
        pair.a.manager.set_echo_handler(Box::new(Reflector(Arc::clone(&responses))));
        pair.b.manager.set_echo_handler(Box::new(Reflector(Arc::new(Mutex::new(Vec::new())))));
        pair.link_up(ConnectionType::Classic);

        pair.a.manager.echo(HA, b"ping").unwrap();
        pair.pump();
        assert_eq!(*responses.lock().unwrap(), vec![(HA, b"gnip".to_vec())]);
        assert!(pair.a.armed(|id| matches!(id, TimerId::Response { .. })).is_empty());
    }

    #[test]
    fn test_connection_parameter_update() {
        let mut pair = Pair::new();
        let slave_responses = Arc::new(Mutex::new(Vec::new()));
        let master_requests = Arc::new(Mutex::new(Vec::new()));
        pair.b.manager.set_connection_parameter_handler(Box::new(ParameterPolicy {
            verdict: Some(false),
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::clone(&slave_responses),
        }));
        pair.link_up(ConnectionType::LE);

        let params = ConnectionParameterUpdate {
            conn_interval_min: 6,
            conn_interval_max: 12,
            conn_latency: 0,
            supervision_timeout: 100,
        };

        // Only the slave may ask
        assert!(matches!(
            pair.a.manager.connection_parameter_update(HA, params),
            Err(L2capError::NotSupported)
        ));

        // Master without a handler rejects
        pair.b.manager.connection_parameter_update(HB, params).unwrap();
        pair.pump();
        assert_eq!(*slave_responses.lock().unwrap(), vec![L2CAP_CONN_PARAM_REJECTED]);

        // Master handler defers, then accepts
        pair.a.manager.set_connection_parameter_handler(Box::new(ParameterPolicy {
            verdict: None,
            requests: Arc::clone(&master_requests),
            responses: Arc::new(Mutex::new(Vec::new())),
        }));
        pair.b.manager.connection_parameter_update(HB, params).unwrap();
        pair.pump();
        let identifier = master_requests.lock().unwrap()[0];
        pair.a
            .manager
            .connection_parameter_update_response(HA, identifier, true)
            .unwrap();
        pair.pump();
        assert_eq!(
            *slave_responses.lock().unwrap(),
            vec![L2CAP_CONN_PARAM_REJECTED, L2CAP_CONN_PARAM_ACCEPTED]
        );

        // A request reaching the slave is not understood
        let request = SignalingMessage::ConnectionParameterUpdateRequest {
            identifier: 0x33,
            params,
        };
        pair.b.manager.receive(HB, &request.to_packet(true).to_bytes());
        assert!(matches!(
            signals(&pair.b.take_sent()).as_slice(),
            [SignalingMessage::CommandReject {
                identifier: 0x33,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                ..
            }]
        ));
    }

    #[test]
    fn test_fixed_channels_pass_through() {
        let mut pair = Pair::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        pair.b.manager.set_fixed_channel_handler(Box::new(FixedRecorder(Arc::clone(&received))));
        pair.link_up(ConnectionType::LE);

        pair.a.manager.send_fixed(HA, L2CAP_ATTRIBUTE_PROTOCOL_CID, &[1, 2, 3]).unwrap();
        pair.pump();
        assert_eq!(
            *received.lock().unwrap(),
            vec![(HB, L2CAP_ATTRIBUTE_PROTOCOL_CID, vec![1, 2, 3])]
        );
        assert!(matches!(
            pair.a.manager.send_fixed(HA, 0x0040, &[0]),
            Err(L2capError::InvalidParameter(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_timer_drops_silent_link() {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let (handle, task) = L2capRuntime::spawn(EngineSettings::default(), Box::new(MockLink(Arc::clone(&log))));
        let events = Events::default();

        handle
            .register(TEST_PSM, Box::new(RecordingService(Arc::clone(&events))), auto())
            .await
            .unwrap();
        let lcid = handle.open(B_ADDR, TEST_PSM, TEST_PSM, None).await.unwrap();
        assert_eq!(log.lock().unwrap().connects.len(), 1);

        handle
            .link_up(B_ADDR, HA, ConnectionType::Classic, LeRole::Master, 0)
            .await
            .unwrap();

        // Nobody answers the information request
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(handle.channel_state(lcid).await.unwrap(), Some(ChannelState::Idle));
        assert_eq!(log.lock().unwrap().disconnects, vec![(HA, HCI_REMOTE_USER_TERMINATED)]);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_shutdown_reported() {
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let (handle, task) = L2capRuntime::spawn(EngineSettings::default(), Box::new(MockLink(log)));
        task.abort();
        let _ = task.await;

        assert!(matches!(handle.close(0x0040).await, Err(L2capError::RuntimeShutdown)));
    }
}
