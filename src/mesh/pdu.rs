//! Lower Transport PDU headers
//!
//! The first octet of every lower transport PDU is `SEG | AKF | AID` for access
//! messages or `SEG | OPCODE` for control messages. Segmented PDUs carry three
//! more octets: `SZMIC (1) | SeqZero (13) | SegO (5) | SegN (5)`, big-endian.

use super::TransportError;
use crate::constants::{SEG_ACK_LEN, SEG_HDR_LEN, SEQ_ZERO_MASK};

/// Transport control opcodes handled by the lower transport layer
pub mod ctl_op {
    /// Segment Acknowledgment
    pub const ACK: u8 = 0x00;
    /// Heartbeat
    pub const HEARTBEAT: u8 = 0x0A;
}

/// Whether the PDU starting with `hdr` is segmented
#[must_use]
pub const fn is_segmented(hdr: u8) -> bool {
    hdr & 0x80 != 0
}

/// Application key flag of an access header
#[must_use]
pub const fn akf(hdr: u8) -> bool {
    (hdr >> 6) & 0x01 != 0
}

/// Application key identifier of an access header
#[must_use]
pub const fn aid(hdr: u8) -> u8 {
    hdr & 0x3F
}

/// Opcode of a control header
#[must_use]
pub const fn ctl_opcode(hdr: u8) -> u8 {
    hdr & 0x7F
}

/// Header octet of an unsegmented access PDU
#[must_use]
pub const fn unseg_hdr(akf: bool, aid: u8) -> u8 {
    ((akf as u8) << 6) | (aid & 0x3F)
}

/// Header octet of a segmented access PDU
#[must_use]
pub const fn seg_hdr(akf: bool, aid: u8) -> u8 {
    unseg_hdr(akf, aid) | 0x80
}

/// Header octet of a control PDU
#[must_use]
pub const fn ctl_hdr(opcode: u8, segmented: bool) -> u8 {
    ((segmented as u8) << 7) | (opcode & 0x7F)
}

/// Segmented PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentHeader {
    /// First header octet (`SEG` set)
    pub hdr: u8,
    /// `SZMIC` for access messages, reserved (`0`) for control messages
    pub szmic: bool,
    /// Low 13 bits of the first segment's sequence number
    pub seq_zero: u16,
    /// Segment offset
    pub seg_o: u8,
    /// Last segment number
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Size of the segmented header in bytes
    pub const SIZE: usize = SEG_HDR_LEN;

    /// Parse a segmented header
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidLength`] if fewer than four bytes are
    /// available.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::SIZE {
            return Err(TransportError::InvalidLength);
        }

        let seq_zero = (u16::from(bytes[1] & 0x7F) << 6) | u16::from(bytes[2] >> 2);

        Ok(Self {
            hdr: bytes[0],
            szmic: bytes[1] & 0x80 != 0,
            seq_zero,
            seg_o: ((bytes[2] & 0x03) << 3) | (bytes[3] >> 5),
            seg_n: bytes[3] & 0x1F,
        })
    }

    /// Encode the header
    #[must_use]
    pub fn to_bytes(self) -> [u8; SEG_HDR_LEN] {
        let seq_zero = self.seq_zero & SEQ_ZERO_MASK;
        [
            self.hdr | 0x80,
            ((self.szmic as u8) << 7) | (seq_zero >> 6) as u8,
            (((seq_zero & 0x3F) as u8) << 2) | ((self.seg_o >> 3) & 0x03),
            ((self.seg_o & 0x07) << 5) | (self.seg_n & 0x1F),
        ]
    }
}

/// Segment Acknowledgment control message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentAck {
    /// Sent by a Friend on behalf of a Low Power Node
    pub obo: bool,
    /// `SeqZero` of the acknowledged message
    pub seq_zero: u16,
    /// Bitmap of received segments; zero cancels the message
    pub block: u32,
}

impl SegmentAck {
    /// Size of the acknowledgment payload in bytes
    pub const SIZE: usize = SEG_ACK_LEN;

    /// Parse an acknowledgment payload
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidLength`] unless exactly six bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() != Self::SIZE {
            return Err(TransportError::InvalidLength);
        }

        let field = u16::from_be_bytes([bytes[0], bytes[1]]);
        Ok(Self {
            obo: field & 0x8000 != 0,
            seq_zero: (field >> 2) & SEQ_ZERO_MASK,
            block: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }

    /// Encode the acknowledgment payload
    #[must_use]
    pub fn to_bytes(self) -> [u8; SEG_ACK_LEN] {
        let field = ((self.seq_zero << 2) & 0x7FFC) | (u16::from(self.obo) << 15);
        let mut bytes = [0u8; SEG_ACK_LEN];
        bytes[0..2].copy_from_slice(&field.to_be_bytes());
        bytes[2..6].copy_from_slice(&self.block.to_be_bytes());
        bytes
    }
}

/// Bitmap with bits `0..=seg_n` set
#[must_use]
pub const fn block_complete(seg_n: u8) -> u32 {
    ((1u64 << (seg_n as u32 + 1)) - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_header_layout() {
        let header = SegmentHeader {
            hdr: seg_hdr(true, 0x15),
            szmic: true,
            seq_zero: 0x1ABC,
            seg_o: 0x13,
            seg_n: 0x1F,
        };

        let bytes = header.to_bytes();
        // SEG=1 AKF=1 AID=0x15
        assert_eq!(bytes[0], 0xD5);
        // SZMIC=1, SeqZero bits 12..6 = 0x6A
        assert_eq!(bytes[1], 0x80 | 0x6A);
        // SeqZero bits 5..0 = 0x3C, SegO bits 4..3 = 0b10
        assert_eq!(bytes[2], (0x3C << 2) | 0x02);
        // SegO bits 2..0 = 0b011, SegN = 0x1F
        assert_eq!(bytes[3], (0x03 << 5) | 0x1F);

        assert_eq!(SegmentHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_segment_header_too_short() {
        assert_eq!(
            SegmentHeader::from_bytes(&[0x80, 0x00, 0x00]),
            Err(TransportError::InvalidLength)
        );
    }

    #[test]
    fn test_segment_ack_layout() {
        let ack = SegmentAck {
            obo: true,
            seq_zero: 0x0123,
            block: 0x0000_0007,
        };

        let bytes = ack.to_bytes();
        assert_eq!(&bytes[..2], &(0x8000u16 | (0x0123 << 2)).to_be_bytes());
        assert_eq!(&bytes[2..], &[0x00, 0x00, 0x00, 0x07]);
        assert_eq!(SegmentAck::from_bytes(&bytes).unwrap(), ack);
    }

    #[test]
    fn test_segment_ack_wrong_length() {
        assert_eq!(
            SegmentAck::from_bytes(&[0; 5]),
            Err(TransportError::InvalidLength)
        );
        assert_eq!(
            SegmentAck::from_bytes(&[0; 7]),
            Err(TransportError::InvalidLength)
        );
    }

    #[test]
    fn test_header_octets() {
        assert!(is_segmented(seg_hdr(false, 0)));
        assert!(!is_segmented(unseg_hdr(true, 0x3F)));
        assert!(akf(unseg_hdr(true, 1)));
        assert_eq!(aid(seg_hdr(true, 0x2A)), 0x2A);
        assert_eq!(ctl_hdr(ctl_op::HEARTBEAT, true), 0x8A);
        assert_eq!(ctl_opcode(0x8A), ctl_op::HEARTBEAT);
    }

    #[test]
    fn test_block_complete() {
        assert_eq!(block_complete(0), 0x1);
        assert_eq!(block_complete(2), 0x7);
        assert_eq!(block_complete(31), u32::MAX);
    }
}
