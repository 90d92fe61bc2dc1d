//! Enhanced retransmission and streaming mode engine
//!
//! The engine owns the sequence counters, the queue of unacknowledged
//! frames and the reassembly buffer of one channel. It performs no I/O:
//! every call records [`ErfcAction`]s that the manager drains and carries
//! out (transmit frames, arm timers, deliver SDUs, notify the service).
//!
//! Frames in the transmit queue are kept in sequence order, so the frame
//! at queue index `i` always carries TxSeq `expected_ack_seq + i`.

use bitflags::bitflags;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::Duration;

use super::constants::L2CAP_SEQ_MODULO;
use super::packet::{EnhancedFrame, L2capControlField, Sar, SupervisoryFunction};
use super::sar::{self, Reassembler};
use super::types::RetransmissionMode;

bitflags! {
    /// Busy and poll state of an enhanced retransmission channel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BusyFlags: u8 {
        /// We asked the peer to stop sending
        const LOCAL_BUSY = 0x01;
        /// Service has been told the peer cannot take more frames
        const REMOTE_BUSY = 0x02;
        /// Peer sent RNR
        const REMOTE_RNR = 0x04;
        /// Poll sent, waiting for a frame with the F bit
        const WAIT_F = 0x08;
    }
}

/// Distance from `start` to `end` modulo 64
pub fn seq_window(end: u8, start: u8) -> u8 {
    (end + L2CAP_SEQ_MODULO - start) % L2CAP_SEQ_MODULO
}

fn next_seq(seq: u8) -> u8 {
    (seq + 1) % L2CAP_SEQ_MODULO
}

/// Side effects requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErfcAction {
    /// Complete frame to hand to the link layer
    Transmit(Vec<u8>),
    StartRetransmissionTimer(Duration),
    StopRetransmissionTimer,
    StartMonitorTimer(Duration),
    StopMonitorTimer,
    /// Reassembled SDU for the service
    Deliver(Vec<u8>),
    /// Remote busy state changed
    RemoteBusy(bool),
    /// Retry limit reached; the channel must be disconnected
    Disconnect,
}

/// Negotiated parameters the engine runs with
#[derive(Debug, Clone, Copy)]
pub struct ErfcParams {
    pub mode: RetransmissionMode,
    pub remote_cid: u16,
    /// Frames we may have outstanding (peer's receive window)
    pub tx_window: u8,
    /// Frames the peer may have outstanding (our receive window)
    pub rx_window: u8,
    /// Transmissions of one frame or poll before giving up; 0 = unlimited
    pub max_transmit: u8,
    pub retransmission_timeout: Duration,
    pub monitor_timeout: Duration,
    /// Largest I-frame payload the peer accepts
    pub remote_mps: u16,
    /// Largest SDU we accept
    pub local_mtu: u16,
    pub fcs: bool,
}

#[derive(Debug)]
struct TxFrame {
    sar: Sar,
    sdu_length: Option<u16>,
    data: Vec<u8>,
    retry_count: u8,
}

/// ARQ control block of one channel
#[derive(Debug)]
pub struct ErfcEngine {
    params: ErfcParams,
    next_tx_seq: u8,
    expected_ack_seq: u8,
    expected_tx_seq: u8,
    buffer_seq: u8,
    queue: VecDeque<TxFrame>,
    /// Frames at the queue front that have been transmitted at least once
    sent: usize,
    reassembler: Reassembler,
    busy: BusyFlags,
    rej_sent: bool,
    retry_count: u8,
    retransmission_running: bool,
    monitor_running: bool,
    actions: Vec<ErfcAction>,
}

impl ErfcEngine {
    pub fn new(params: ErfcParams) -> Self {
        Self {
            params,
            next_tx_seq: 0,
            expected_ack_seq: 0,
            expected_tx_seq: 0,
            buffer_seq: 0,
            queue: VecDeque::new(),
            sent: 0,
            reassembler: Reassembler::new(params.local_mtu as usize),
            busy: BusyFlags::empty(),
            rej_sent: false,
            retry_count: 0,
            retransmission_running: false,
            monitor_running: false,
            actions: Vec::new(),
        }
    }

    pub fn params(&self) -> &ErfcParams {
        &self.params
    }

    pub fn busy(&self) -> BusyFlags {
        self.busy
    }

    pub fn next_tx_seq(&self) -> u8 {
        self.next_tx_seq
    }

    pub fn expected_ack_seq(&self) -> u8 {
        self.expected_ack_seq
    }

    pub fn expected_tx_seq(&self) -> u8 {
        self.expected_tx_seq
    }

    /// Sequence number the next queued segment will carry
    pub fn next_sequence(&self) -> u8 {
        ((self.expected_ack_seq as usize + self.queue.len()) % L2CAP_SEQ_MODULO as usize) as u8
    }

    /// Frames queued but not yet acknowledged, including unsent ones
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take the actions recorded since the last call
    pub fn take_actions(&mut self) -> Vec<ErfcAction> {
        std::mem::take(&mut self.actions)
    }

    fn is_streaming(&self) -> bool {
        self.params.mode == RetransmissionMode::Streaming
    }

    fn outstanding(&self) -> usize {
        seq_window(self.next_tx_seq, self.expected_ack_seq) as usize
    }

    fn exhausted(&self, count: u8) -> bool {
        self.params.max_transmit != 0 && count >= self.params.max_transmit
    }

    /// Segment and queue an SDU, transmitting what the window allows
    pub fn send_sdu(&mut self, sdu: &[u8]) {
        let segments = sar::segment(sdu, self.params.remote_mps as usize);
        debug!(
            "Queueing SDU of {} bytes as {} frame(s) on CID 0x{:04X}",
            sdu.len(),
            segments.len(),
            self.params.remote_cid
        );

        if self.is_streaming() {
            for segment in segments {
                let control = L2capControlField::new_i_frame(self.next_tx_seq, 0, false, segment.sar);
                let frame = EnhancedFrame {
                    control,
                    sdu_length: segment.sdu_length,
                    payload: segment.data,
                };
                self.emit(frame);
                self.next_tx_seq = next_seq(self.next_tx_seq);
            }
            return;
        }

        self.queue.extend(segments.into_iter().map(|segment| TxFrame {
            sar: segment.sar,
            sdu_length: segment.sdu_length,
            data: segment.data,
            retry_count: 0,
        }));
        self.transmit();
    }

    fn emit(&mut self, frame: EnhancedFrame) {
        let bytes = frame.encode(self.params.remote_cid, self.params.fcs);
        trace!("ERTM TX {:?}: {}", frame.control, hex::encode(&bytes));
        self.actions.push(ErfcAction::Transmit(bytes));
    }

    fn i_frame(&self, index: usize, tx_seq: u8) -> EnhancedFrame {
        let frame = &self.queue[index];
        EnhancedFrame {
            control: L2capControlField::new_i_frame(tx_seq, self.expected_tx_seq, false, frame.sar),
            sdu_length: frame.sdu_length,
            payload: frame.data.clone(),
        }
    }

    fn send_s_frame(&mut self, function: SupervisoryFunction, poll: bool, final_bit: bool) {
        let control = L2capControlField::new_s_frame(function, self.expected_tx_seq, poll, final_bit);
        self.buffer_seq = self.expected_tx_seq;
        self.emit(EnhancedFrame::supervisory(control));
    }

    fn ready_function(&self) -> SupervisoryFunction {
        if self.busy.contains(BusyFlags::LOCAL_BUSY) {
            SupervisoryFunction::ReceiverNotReady
        } else {
            SupervisoryFunction::ReceiverReady
        }
    }

    fn send_ack(&mut self) {
        let function = self.ready_function();
        self.send_s_frame(function, false, false);
    }

    fn send_poll(&mut self) {
        let function = self.ready_function();
        self.send_s_frame(function, true, false);
        self.busy.insert(BusyFlags::WAIT_F);
        self.start_monitor_timer();
    }

    fn start_retransmission_timer(&mut self) {
        self.actions.push(ErfcAction::StartRetransmissionTimer(
            self.params.retransmission_timeout,
        ));
        self.retransmission_running = true;
    }

    fn stop_retransmission_timer(&mut self) {
        if self.retransmission_running {
            self.actions.push(ErfcAction::StopRetransmissionTimer);
            self.retransmission_running = false;
        }
    }

    fn start_monitor_timer(&mut self) {
        self.actions
            .push(ErfcAction::StartMonitorTimer(self.params.monitor_timeout));
        self.monitor_running = true;
    }

    fn stop_monitor_timer(&mut self) {
        if self.monitor_running {
            self.actions.push(ErfcAction::StopMonitorTimer);
            self.monitor_running = false;
        }
    }

    fn set_remote_busy(&mut self, busy: bool) {
        if self.busy.contains(BusyFlags::REMOTE_BUSY) != busy {
            self.busy.set(BusyFlags::REMOTE_BUSY, busy);
            self.actions.push(ErfcAction::RemoteBusy(busy));
        }
    }

    /// Send queued frames while the transmit window has room
    fn transmit(&mut self) {
        if self.is_streaming() || self.busy.intersects(BusyFlags::REMOTE_RNR | BusyFlags::WAIT_F) {
            return;
        }

        let window = self.params.tx_window as usize;
        let mut index = self.outstanding();
        if index >= window {
            self.set_remote_busy(true);
            return;
        }

        let mut available = window - index;
        while available > 0 && index < self.queue.len() {
            if self.exhausted(self.queue[index].retry_count) {
                warn!(
                    "Frame {} on CID 0x{:04X} reached max transmit {}",
                    self.next_tx_seq, self.params.remote_cid, self.params.max_transmit
                );
                self.actions.push(ErfcAction::Disconnect);
                return;
            }
            self.queue[index].retry_count += 1;

            let frame = self.i_frame(index, self.next_tx_seq);
            self.emit(frame);
            self.buffer_seq = self.expected_tx_seq;
            self.next_tx_seq = next_seq(self.next_tx_seq);

            index += 1;
            available -= 1;
            self.sent = self.sent.max(index);
        }

        if self.outstanding() > 0 && !self.retransmission_running {
            self.start_retransmission_timer();
        }
        self.set_remote_busy(available == 0);
    }

    /// Retire every outbound frame before `req_seq`
    fn process_req_seq(&mut self, req_seq: u8) {
        let acked = seq_window(req_seq, self.expected_ack_seq) as usize;
        if acked == 0 {
            return;
        }
        // Duplicated I-frames carry stale ReqSeq values, so a ReqSeq past
        // the sent frames is ignored rather than treated as a violation
        if acked > self.sent {
            debug!(
                "Ignoring ReqSeq {} beyond sent frames (expected ack {}, {} sent)",
                req_seq, self.expected_ack_seq, self.sent
            );
            return;
        }

        let outstanding = self.outstanding();
        self.queue.drain(..acked);
        self.sent -= acked;
        self.expected_ack_seq = req_seq;
        if acked > outstanding {
            self.next_tx_seq = req_seq;
        }

        self.stop_retransmission_timer();
        if self.outstanding() > 0 && !self.busy.contains(BusyFlags::WAIT_F) {
            self.start_retransmission_timer();
        }
    }

    fn process_final(&mut self, req_seq: u8) {
        if !self.busy.contains(BusyFlags::WAIT_F) {
            return;
        }
        self.stop_monitor_timer();
        self.busy.remove(BusyFlags::WAIT_F);
        self.retry_count = 0;
        if seq_window(req_seq, self.expected_ack_seq) == 0 {
            self.next_tx_seq = req_seq;
        }
    }

    fn retransmit_one(&mut self, req_seq: u8) {
        let index = seq_window(req_seq, self.expected_ack_seq) as usize;
        if index >= self.sent {
            debug!("SREJ for unsent frame {}", req_seq);
            return;
        }
        if self.exhausted(self.queue[index].retry_count) {
            warn!(
                "Frame {} on CID 0x{:04X} reached max transmit {}",
                req_seq, self.params.remote_cid, self.params.max_transmit
            );
            self.actions.push(ErfcAction::Disconnect);
            return;
        }
        self.queue[index].retry_count += 1;
        let frame = self.i_frame(index, req_seq);
        self.emit(frame);
        self.buffer_seq = self.expected_tx_seq;
        if !self.retransmission_running && !self.busy.contains(BusyFlags::WAIT_F) {
            self.start_retransmission_timer();
        }
    }

    /// Handle one received frame on this channel
    pub fn receive(&mut self, bytes: &[u8]) {
        let Some(frame) = EnhancedFrame::decode(bytes, self.params.fcs) else {
            warn!(
                "Dropping malformed or corrupted frame from CID 0x{:04X}",
                self.params.remote_cid
            );
            return;
        };
        trace!("ERTM RX {:?}: {}", frame.control, hex::encode(bytes));

        match frame.control {
            L2capControlField::Information {
                tx_seq,
                req_seq,
                final_bit,
                sar,
            } => {
                if self.is_streaming() {
                    self.receive_streaming(tx_seq, sar, frame.sdu_length, &frame.payload);
                } else {
                    self.receive_i_frame(tx_seq, req_seq, final_bit, sar, frame.sdu_length, &frame.payload);
                }
            }
            L2capControlField::Supervisory {
                function,
                req_seq,
                poll,
                final_bit,
            } => {
                if !self.is_streaming() {
                    self.receive_s_frame(function, req_seq, poll, final_bit);
                }
            }
        }
    }

    fn receive_streaming(&mut self, tx_seq: u8, sar: Sar, sdu_length: Option<u16>, payload: &[u8]) {
        if tx_seq != self.expected_tx_seq {
            debug!(
                "Streaming gap: expected {}, got {}; dropping partial SDU",
                self.expected_tx_seq, tx_seq
            );
            self.reassembler.reset();
        }
        self.expected_tx_seq = next_seq(tx_seq);

        if let Some(sdu) = self.reassembler.push(sar, sdu_length, payload) {
            self.actions.push(ErfcAction::Deliver(sdu));
        }
    }

    fn receive_i_frame(
        &mut self,
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: Sar,
        sdu_length: Option<u16>,
        payload: &[u8],
    ) {
        self.process_req_seq(req_seq);
        if final_bit {
            self.process_final(req_seq);
        }

        if tx_seq != self.expected_tx_seq {
            let ahead = seq_window(tx_seq, self.expected_tx_seq);
            if ahead < self.params.rx_window {
                if !self.rej_sent {
                    debug!(
                        "Sequence gap: expected {}, got {}; sending REJ",
                        self.expected_tx_seq, tx_seq
                    );
                    self.rej_sent = true;
                    self.send_s_frame(SupervisoryFunction::Reject, false, false);
                }
            } else {
                debug!("Discarding duplicate I-frame {}", tx_seq);
            }
            self.transmit();
            return;
        }

        self.rej_sent = false;
        self.expected_tx_seq = next_seq(tx_seq);

        let delivered = match self.reassembler.push(sar, sdu_length, payload) {
            Some(sdu) => {
                self.actions.push(ErfcAction::Deliver(sdu));
                true
            }
            None => false,
        };

        let pending = seq_window(self.expected_tx_seq, self.buffer_seq);
        let unsent = self.queue.len() - self.outstanding().min(self.queue.len());
        if pending >= self.params.rx_window.saturating_sub(1).max(1) || (delivered && unsent == 0) {
            self.send_ack();
        }

        self.transmit();
    }

    fn receive_s_frame(&mut self, function: SupervisoryFunction, req_seq: u8, poll: bool, final_bit: bool) {
        if function != SupervisoryFunction::SelectiveReject || poll {
            self.process_req_seq(req_seq);
        }
        if final_bit {
            self.process_final(req_seq);
        }
        if poll {
            let function = self.ready_function();
            self.send_s_frame(function, false, true);
        }

        match function {
            SupervisoryFunction::ReceiverReady => {
                if self.busy.contains(BusyFlags::REMOTE_RNR) {
                    if poll || final_bit {
                        self.busy.remove(BusyFlags::REMOTE_RNR);
                        if !self.busy.contains(BusyFlags::WAIT_F) {
                            self.stop_monitor_timer();
                        }
                        self.transmit();
                    }
                } else {
                    self.transmit();
                }
            }
            SupervisoryFunction::Reject => {
                if seq_window(req_seq, self.expected_ack_seq) == 0 {
                    self.next_tx_seq = req_seq;
                }
                self.busy.remove(BusyFlags::REMOTE_RNR);
                self.transmit();
            }
            SupervisoryFunction::ReceiverNotReady => {
                self.busy.insert(BusyFlags::REMOTE_RNR);
                self.set_remote_busy(true);
                self.stop_retransmission_timer();
                if !self.busy.contains(BusyFlags::WAIT_F) && !self.monitor_running {
                    self.start_monitor_timer();
                }
            }
            SupervisoryFunction::SelectiveReject => self.retransmit_one(req_seq),
        }
    }

    pub fn handle_retransmission_timeout(&mut self) {
        self.retransmission_running = false;
        if self.is_streaming() {
            return;
        }
        debug!(
            "Retransmission timeout on CID 0x{:04X}, polling peer",
            self.params.remote_cid
        );
        self.send_poll();
        self.retry_count = 1;
        self.set_remote_busy(true);
    }

    pub fn handle_monitor_timeout(&mut self) {
        self.monitor_running = false;
        if self.is_streaming() {
            return;
        }
        if self.exhausted(self.retry_count) {
            warn!(
                "No answer to {} polls on CID 0x{:04X}",
                self.retry_count, self.params.remote_cid
            );
            self.actions.push(ErfcAction::Disconnect);
            return;
        }
        self.send_poll();
        self.retry_count += 1;
    }

    /// Enter or leave local busy; the peer is told with RNR or a polling RR
    pub fn set_local_busy(&mut self, busy: bool) {
        if self.is_streaming() || self.busy.contains(BusyFlags::LOCAL_BUSY) == busy {
            return;
        }
        self.busy.set(BusyFlags::LOCAL_BUSY, busy);
        if busy {
            self.send_s_frame(SupervisoryFunction::ReceiverNotReady, false, false);
        } else {
            self.send_s_frame(SupervisoryFunction::ReceiverReady, true, false);
        }
    }
}
