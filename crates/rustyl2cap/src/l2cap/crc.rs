//! Frame check sequence for enhanced retransmission and streaming frames
//!
//! CRC-16 with generator x^16 + x^15 + x^2 + 1, processed LSB first with a
//! zero initial value (reflected polynomial 0xA001).

const POLY_REFLECTED: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_table();

/// Continue a running FCS over `data`
pub fn fcs_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u16) & 0xFF) as usize];
    }
    crc
}

/// FCS over one contiguous buffer
pub fn fcs(data: &[u8]) -> u16 {
    fcs_update(0, data)
}

/// Check the trailing two FCS bytes of `frame`
pub fn verify(frame: &[u8]) -> bool {
    match frame.len().checked_sub(2) {
        Some(split) => {
            let (body, tail) = frame.split_at(split);
            fcs(body) == u16::from_le_bytes([tail[0], tail[1]])
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(fcs(b"123456789"), 0xBB3D);
        assert_eq!(fcs(&[]), 0);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = [0x0Eu8, 0x00, 0x40, 0x00, 0x02, 0x00, 0x00, 0x01, 0x02, 0x03];
        let split = fcs_update(fcs(&data[..4]), &data[4..]);
        assert_eq!(split, fcs(&data));
    }

    #[test]
    fn test_verify() {
        let mut frame = vec![0x04, 0x00, 0x40, 0x00, 0x01, 0x01];
        let crc = fcs(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(verify(&frame));

        frame[4] ^= 0x01;
        assert!(!verify(&frame));
        assert!(!verify(&[0x01]));
    }
}
