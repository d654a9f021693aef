//! ACL (Asynchronous Connection-Less) Data Header
//!
//! The first four bytes of every HCI ACL Data packet: a 12-bit connection
//! handle with the packet-boundary and broadcast flags in its top nibble,
//! followed by the data length of this fragment.

use super::HciError;
use bt_hci::param::ConnHandle;

/// Largest valid connection handle
pub const MAX_CONN_HANDLE: u16 = 0x0EFF;

/// ACL Packet Boundary flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-flushable fragment (host to controller)
    FirstNonFlushable = 0x00,
    /// Continuing fragment
    ContinuingFragment = 0x01,
    /// First flushable fragment
    FirstFlushable = 0x02,
    /// Complete PDU, loopback only
    CompletePdu = 0x03,
}

impl PacketBoundary {
    /// Convert from raw 2-bit value
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::FirstNonFlushable,
            0x01 => Self::ContinuingFragment,
            0x02 => Self::FirstFlushable,
            _ => Self::CompletePdu,
        }
    }

    /// Whether this fragment starts a new higher-layer PDU
    #[must_use]
    pub fn is_start(self) -> bool {
        !matches!(self, Self::ContinuingFragment)
    }
}

/// ACL Broadcast flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BroadcastFlag {
    /// Point-to-point (no broadcast)
    PointToPoint = 0x00,
    /// Active broadcast
    ActiveBroadcast = 0x01,
    /// Reserved
    Reserved2 = 0x02,
    /// Reserved
    Reserved3 = 0x03,
}

impl BroadcastFlag {
    /// Convert from raw 2-bit value
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::PointToPoint,
            0x01 => Self::ActiveBroadcast,
            0x02 => Self::Reserved2,
            _ => Self::Reserved3,
        }
    }
}

/// ACL Data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet boundary flag (2 bits)
    pub packet_boundary: PacketBoundary,
    /// Broadcast flag (2 bits)
    pub broadcast_flag: BroadcastFlag,
    /// Length of the data in this fragment
    pub data_length: u16,
}

impl AclHeader {
    /// Size of ACL header in bytes
    pub const SIZE: usize = 4;

    /// Create new ACL header
    #[must_use]
    pub fn new(
        handle: u16,
        packet_boundary: PacketBoundary,
        broadcast_flag: BroadcastFlag,
        data_length: u16,
    ) -> Self {
        Self {
            handle: handle & 0x0FFF,
            packet_boundary,
            broadcast_flag,
            data_length,
        }
    }

    /// Parse ACL header from bytes
    ///
    /// # Errors
    ///
    /// Returns [`HciError::InvalidLength`] if fewer than four bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HciError> {
        let [lo, hi, len_lo, len_hi, ..] = *bytes else {
            return Err(HciError::InvalidLength);
        };

        let handle_and_flags = u16::from_le_bytes([lo, hi]);
        Ok(Self::new(
            handle_and_flags,
            PacketBoundary::from_u8((handle_and_flags >> 12) as u8),
            BroadcastFlag::from_u8((handle_and_flags >> 14) as u8),
            u16::from_le_bytes([len_lo, len_hi]),
        ))
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let handle_and_flags = self.handle
            | ((self.packet_boundary as u16) << 12)
            | ((self.broadcast_flag as u16) << 14);

        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&handle_and_flags.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        bytes
    }

    /// Connection handle as a `bt-hci` parameter, `None` for the reserved
    /// range above `0x0EFF`
    #[must_use]
    pub fn conn_handle(&self) -> Option<ConnHandle> {
        (self.handle <= MAX_CONN_HANDLE).then(|| ConnHandle::new(self.handle))
    }

    /// Same header for a fragment with different boundary flag and length
    #[must_use]
    pub fn fragment(self, packet_boundary: PacketBoundary, data_length: u16) -> Self {
        Self {
            packet_boundary,
            data_length,
            ..self
        }
    }
}
