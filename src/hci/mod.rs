//! HCI Host Transport
//!
//! Host side of the Host Controller Interface: H4 framing over a byte stream,
//! command flow control with the controller's credit scheme, ACL
//! fragmentation and reassembly, and the [`layer::HciLayer`] that ties them
//! together.
//!
//! Packets are kept in their HCI wire form without the H4 indicator byte;
//! the indicator is carried separately as a [`PacketKind`].

pub mod acl;
pub mod command;
pub mod fragmenter;
pub mod h4;
pub mod layer;

use crate::constants::MAX_HCI_PACKET_SIZE;
use bt_hci::FromHciBytes;
use bt_hci::event::EventPacketHeader;
use heapless::Vec;

pub use bt_hci::PacketKind;

/// Length of the packet header that carries the body length
#[must_use]
pub const fn preamble_len(kind: PacketKind) -> usize {
    match kind {
        PacketKind::Cmd | PacketKind::SyncData => 3,
        PacketKind::Event => 2,
        PacketKind::AclData | PacketKind::IsoData => 4,
    }
}

/// Body length announced by a complete preamble
#[must_use]
pub fn body_len(kind: PacketKind, preamble: &[u8]) -> usize {
    match kind {
        PacketKind::Cmd | PacketKind::SyncData => usize::from(preamble[2]),
        PacketKind::Event => usize::from(preamble[1]),
        PacketKind::AclData => usize::from(u16::from_le_bytes([preamble[2], preamble[3]])),
        // Upper two bits are reserved
        PacketKind::IsoData => {
            usize::from(u16::from_le_bytes([preamble[2], preamble[3]]) & 0x3FFF)
        }
    }
}

/// Controller type an ACL packet is destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkType {
    /// BR/EDR
    #[default]
    Classic,
    /// Low Energy
    Le,
}

/// HCI packet in wire form, without the H4 indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket {
    kind: PacketKind,
    link: LinkType,
    segment_budget: u8,
    data: Vec<u8, MAX_HCI_PACKET_SIZE>,
}

impl HciPacket {
    /// Build a packet from its header and body bytes
    ///
    /// # Errors
    ///
    /// Returns [`HciError::PacketTooLarge`] if `data` exceeds
    /// [`MAX_HCI_PACKET_SIZE`].
    pub fn new(kind: PacketKind, data: &[u8]) -> Result<Self, HciError> {
        let data = Vec::from_slice(data).map_err(|()| HciError::PacketTooLarge)?;
        Ok(Self {
            kind,
            link: LinkType::Classic,
            segment_budget: 0,
            data,
        })
    }

    /// Build an outbound ACL packet for the given controller type
    ///
    /// # Errors
    ///
    /// Returns [`HciError::PacketTooLarge`] if `data` exceeds
    /// [`MAX_HCI_PACKET_SIZE`].
    pub fn acl(link: LinkType, data: &[u8]) -> Result<Self, HciError> {
        let mut packet = Self::new(PacketKind::AclData, data)?;
        packet.link = link;
        Ok(packet)
    }

    /// Cap the number of fragments sent before the remainder is handed back
    /// as a separate packet. `0` means no cap.
    #[must_use]
    pub fn with_segment_budget(mut self, budget: u8) -> Self {
        self.segment_budget = budget;
        self
    }

    /// Packet indicator
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Controller type (meaningful for outbound ACL only)
    #[must_use]
    pub fn link(&self) -> LinkType {
        self.link
    }

    /// Fragment budget, `0` for none
    #[must_use]
    pub fn segment_budget(&self) -> u8 {
        self.segment_budget
    }

    /// Header and body bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Body bytes following the type-specific header
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.data
            .get(preamble_len(self.kind)..)
            .unwrap_or_default()
    }
}

/// HCI transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    /// Command or packet queue is full
    QueueFull,
    /// Too many commands awaiting a controller response
    PendingListFull,
    /// Header or parameter length out of range
    InvalidLength,
    /// Packet type not valid for the operation
    InvalidPacketType,
    /// Packet does not fit the host buffers
    PacketTooLarge,
    /// Controller did not answer a command in time
    CommandTimeout,
    /// Underlying byte stream failed
    Transport,
}

impl core::fmt::Display for HciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HciError::QueueFull => write!(f, "Queue full"),
            HciError::PendingListFull => write!(f, "Pending command list full"),
            HciError::InvalidLength => write!(f, "Invalid length"),
            HciError::InvalidPacketType => write!(f, "Invalid packet type"),
            HciError::PacketTooLarge => write!(f, "Packet too large"),
            HciError::CommandTimeout => write!(f, "Command timeout"),
            HciError::Transport => write!(f, "Transport error"),
        }
    }
}

/// HCI event codes handled by the host transport
pub mod event_code {
    /// Command Complete
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    /// Command Status
    pub const COMMAND_STATUS: u8 = 0x0F;
    /// Number Of Completed Packets
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
}

/// Command opcodes the host transport reacts to
pub mod opcode {
    /// No operation, used by the controller for unsolicited credit updates
    pub const NOP: u16 = 0x0000;
    /// Reset
    pub const RESET: u16 = 0x0C03;
    /// Read Buffer Size
    pub const READ_BUFFER_SIZE: u16 = 0x1005;
    /// LE Read Buffer Size
    pub const LE_READ_BUFFER_SIZE: u16 = 0x2002;
}

/// Split an event packet into its code and parameters
#[must_use]
pub fn event_parts(packet: &[u8]) -> Option<(u8, &[u8])> {
    let (header, rest) = EventPacketHeader::from_hci_bytes(packet).ok()?;
    let params = rest.get(..usize::from(header.params_len))?;
    Some((header.code, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_lengths() {
        let (kind, _) = PacketKind::from_hci_bytes(&[0x04]).unwrap();
        assert_eq!(kind, PacketKind::Event);
        assert!(PacketKind::from_hci_bytes(&[0x06]).is_err());

        assert_eq!(preamble_len(PacketKind::Event), 2);
        assert_eq!(body_len(PacketKind::Event, &[0x0E, 0x04]), 4);
        assert_eq!(body_len(PacketKind::Cmd, &[0x03, 0x0C, 0x00]), 0);
        assert_eq!(body_len(PacketKind::AclData, &[0x01, 0x20, 0x00, 0x01]), 256);
        assert_eq!(body_len(PacketKind::IsoData, &[0x01, 0x20, 0x10, 0xC0]), 16);
    }

    #[test]
    fn test_packet_payload() {
        let packet = HciPacket::new(PacketKind::Event, &[0x0E, 0x01, 0xAA]).unwrap();
        assert_eq!(packet.payload(), &[0xAA]);

        let too_big = [0u8; MAX_HCI_PACKET_SIZE + 1];
        assert_eq!(
            HciPacket::new(PacketKind::AclData, &too_big),
            Err(HciError::PacketTooLarge)
        );
    }

    #[test]
    fn test_event_parts() {
        let event = [0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00, 0xFF];
        let (code, params) = event_parts(&event).unwrap();
        assert_eq!(code, event_code::COMMAND_COMPLETE);
        // Trailing bytes past the declared length are not parameters
        assert_eq!(params, &[0x01, 0x03, 0x0C, 0x00]);

        // Declared length longer than the packet
        assert!(event_parts(&[0x0E, 0x05, 0x01]).is_none());
        assert!(event_parts(&[0x0E]).is_none());
    }
}
