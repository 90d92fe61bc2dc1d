//! Segmentation and reassembly of SDUs
//!
//! Enhanced retransmission and streaming channels mark segments with SAR
//! bits; LE credit based channels only prefix the first segment with the
//! SDU length. In both cases the SDU length field counts against the MPS.

use log::debug;

use super::constants::L2CAP_SDU_LENGTH_SIZE;
use super::packet::Sar;

/// One outbound segment of an enhanced retransmission or streaming SDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sar: Sar,
    pub sdu_length: Option<u16>,
    pub data: Vec<u8>,
}

/// Data bytes of a start segment; negotiation keeps `mps` above the SDU
/// length field
fn first_chunk_size(mps: usize) -> usize {
    mps.saturating_sub(L2CAP_SDU_LENGTH_SIZE).max(1)
}

/// Split `sdu` into SAR-tagged segments no larger than `mps`
pub fn segment(sdu: &[u8], mps: usize) -> Vec<Segment> {
    if sdu.len() <= mps {
        return vec![Segment {
            sar: Sar::Unsegmented,
            sdu_length: None,
            data: sdu.to_vec(),
        }];
    }

    let first = first_chunk_size(mps);
    let mut segments = vec![Segment {
        sar: Sar::Start,
        sdu_length: Some(sdu.len() as u16),
        data: sdu[..first].to_vec(),
    }];

    let mut rest = &sdu[first..];
    let mps = mps.max(1);
    while !rest.is_empty() {
        let take = rest.len().min(mps);
        let sar = if take == rest.len() {
            Sar::End
        } else {
            Sar::Continuation
        };
        segments.push(Segment {
            sar,
            sdu_length: None,
            data: rest[..take].to_vec(),
        });
        rest = &rest[take..];
    }

    segments
}

/// Split `sdu` into LE credit based payloads no larger than `mps`;
/// the first always carries the SDU length
pub fn segment_le(sdu: &[u8], mps: usize) -> Vec<Vec<u8>> {
    let first = first_chunk_size(mps).min(sdu.len());
    let mut head = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + first);
    head.extend_from_slice(&(sdu.len() as u16).to_le_bytes());
    head.extend_from_slice(&sdu[..first]);

    let mut payloads = vec![head];
    payloads.extend(sdu[first..].chunks(mps.max(1)).map(<[u8]>::to_vec));
    payloads
}

#[derive(Debug)]
struct Partial {
    expected: usize,
    data: Vec<u8>,
}

/// Reassembles SAR-tagged segments; holds at most one partial SDU
#[derive(Debug)]
pub struct Reassembler {
    partial: Option<Partial>,
    max_sdu: usize,
}

impl Reassembler {
    pub fn new(max_sdu: usize) -> Self {
        Self {
            partial: None,
            max_sdu,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Drop any partial SDU
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed one segment; returns a complete SDU when one is finished
    pub fn push(&mut self, sar: Sar, sdu_length: Option<u16>, payload: &[u8]) -> Option<Vec<u8>> {
        match sar {
            Sar::Unsegmented => {
                if self.partial.take().is_some() {
                    debug!("Unsegmented frame interrupts partial SDU, dropping partial");
                }
                if payload.len() > self.max_sdu {
                    debug!("SDU of {} bytes exceeds MTU {}", payload.len(), self.max_sdu);
                    return None;
                }
                Some(payload.to_vec())
            }
            Sar::Start => {
                let expected = sdu_length? as usize;
                if expected > self.max_sdu || payload.len() >= expected {
                    debug!("Invalid start segment: declared {} bytes", expected);
                    self.partial = None;
                    return None;
                }
                let mut data = Vec::with_capacity(expected);
                data.extend_from_slice(payload);
                self.partial = Some(Partial { expected, data });
                None
            }
            Sar::Continuation => {
                let Some(partial) = self.partial.as_mut() else {
                    debug!("Continuation without start, dropping");
                    return None;
                };
                partial.data.extend_from_slice(payload);
                if partial.data.len() >= partial.expected {
                    debug!("Continuation overruns declared SDU length, dropping");
                    self.partial = None;
                }
                None
            }
            Sar::End => {
                let Some(mut partial) = self.partial.take() else {
                    debug!("End without start, dropping");
                    return None;
                };
                partial.data.extend_from_slice(payload);
                if partial.data.len() == partial.expected {
                    Some(partial.data)
                } else {
                    debug!(
                        "SDU length mismatch: declared {}, assembled {}",
                        partial.expected,
                        partial.data.len()
                    );
                    None
                }
            }
        }
    }
}

/// Reassembles LE credit based segments
#[derive(Debug)]
pub struct LeReassembler {
    partial: Option<Partial>,
    max_sdu: usize,
}

impl LeReassembler {
    pub fn new(max_sdu: usize) -> Self {
        Self {
            partial: None,
            max_sdu,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Feed one PDU payload; returns a complete SDU when one is finished
    pub fn push(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let mut partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                if payload.len() < L2CAP_SDU_LENGTH_SIZE {
                    debug!("LE first segment too short for SDU length");
                    return None;
                }
                let expected = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                if expected > self.max_sdu {
                    debug!("LE SDU of {} bytes exceeds MTU {}", expected, self.max_sdu);
                    return None;
                }
                let data = payload[L2CAP_SDU_LENGTH_SIZE..].to_vec();
                return self.finish_or_hold(Partial { expected, data });
            }
        };

        partial.data.extend_from_slice(payload);
        self.finish_or_hold(partial)
    }

    fn finish_or_hold(&mut self, partial: Partial) -> Option<Vec<u8>> {
        if partial.data.len() > partial.expected {
            debug!(
                "LE segment overruns declared SDU length {}, aborting SDU",
                partial.expected
            );
            None
        } else if partial.data.len() == partial.expected {
            Some(partial.data)
        } else {
            self.partial = Some(partial);
            None
        }
    }
}
