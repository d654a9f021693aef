//! ACL fragmentation and reassembly
//!
//! Outbound ACL packets larger than the controller's data buffer are split
//! one fragment at a time: the fragmenter holds a single packet in progress
//! and hands out the next fragment only when asked, so the transmit path
//! paces emission. Inbound fragments are reassembled per connection handle
//! into complete L2CAP PDUs.

use super::acl::{AclHeader, PacketBoundary};
use super::{HciError, HciPacket, LinkType, PacketKind};
use crate::constants::{
    DEFAULT_ACL_DATA_SIZE_CLASSIC, DEFAULT_ACL_DATA_SIZE_LE, MAX_HCI_PACKET_SIZE,
    MAX_PARTIAL_PACKETS,
};
use heapless::{FnvIndexMap, Vec};

const L2CAP_HEADER_LEN: usize = 4;

/// Next step of an outbound fragmentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Send this fragment to the controller
    Send(HciPacket),
    /// Segment budget spent; queue the remainder as a new packet
    Requeue(HciPacket),
}

#[derive(Debug)]
struct Outbound {
    packet: HciPacket,
    header: AclHeader,
    offset: usize,
    budget: Option<u8>,
}

/// Splits outbound ACL packets to the controller's buffer size
#[derive(Debug)]
pub struct AclFragmenter {
    classic_size: u16,
    le_size: u16,
    current: Option<Outbound>,
}

impl Default for AclFragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_ACL_DATA_SIZE_CLASSIC, DEFAULT_ACL_DATA_SIZE_LE)
    }
}

impl AclFragmenter {
    /// Create a fragmenter for the given controller buffer sizes
    #[must_use]
    pub fn new(classic_size: u16, le_size: u16) -> Self {
        Self {
            classic_size,
            le_size,
            current: None,
        }
    }

    /// Update the controller buffer sizes. An LE size of `0` means LE traffic
    /// shares the classic buffers.
    pub fn set_acl_data_sizes(&mut self, classic_size: u16, le_size: u16) {
        debug!(
            "[FRAG] ACL data sizes: classic {}, le {}",
            classic_size,
            le_size
        );
        self.classic_size = classic_size;
        self.le_size = le_size;
    }

    /// Configured `(classic, le)` buffer sizes
    #[must_use]
    pub fn acl_data_sizes(&self) -> (u16, u16) {
        (self.classic_size, self.le_size)
    }

    /// Largest fragment payload for the given controller type
    #[must_use]
    pub fn max_fragment(&self, link: LinkType) -> usize {
        match link {
            LinkType::Le if self.le_size != 0 => usize::from(self.le_size),
            _ => usize::from(self.classic_size),
        }
    }

    /// Whether a packet is being fragmented
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Start fragmenting an ACL packet
    ///
    /// # Errors
    ///
    /// * [`HciError::InvalidPacketType`] for non-ACL packets
    /// * [`HciError::InvalidLength`] if the ACL header is missing
    /// * [`HciError::QueueFull`] if another packet is still in progress
    pub fn start(&mut self, packet: HciPacket) -> Result<(), HciError> {
        if packet.kind() != PacketKind::AclData {
            return Err(HciError::InvalidPacketType);
        }
        if self.current.is_some() {
            return Err(HciError::QueueFull);
        }
        let header = AclHeader::from_bytes(packet.as_bytes())?;
        let budget = match packet.segment_budget() {
            0 => None,
            budget => Some(budget),
        };
        self.current = Some(Outbound {
            packet,
            header,
            offset: 0,
            budget,
        });
        Ok(())
    }

    /// Produce the next fragment of the packet in progress
    pub fn next_fragment(&mut self) -> Option<Fragment> {
        let mut out = self.current.take()?;
        let payload = out.packet.payload();
        let max = self.max_fragment(out.packet.link()).max(1);

        if out.offset == 0 && payload.len() <= max {
            return Some(Fragment::Send(out.packet));
        }

        let rest = &payload[out.offset..];
        if out.budget == Some(0) {
            trace!("[FRAG] Budget spent, requeueing {} bytes", rest.len());
            let header = out
                .header
                .fragment(PacketBoundary::ContinuingFragment, rest.len() as u16);
            return build(header, rest, out.packet.link()).map(Fragment::Requeue);
        }

        let chunk = rest.len().min(max);
        let boundary = if out.offset == 0 {
            out.header.packet_boundary
        } else {
            PacketBoundary::ContinuingFragment
        };
        let header = out.header.fragment(boundary, chunk as u16);
        let fragment = build(header, &rest[..chunk], out.packet.link())?;

        out.offset += chunk;
        out.budget = out.budget.map(|budget| budget - 1);
        if out.offset < payload.len() {
            self.current = Some(out);
        }
        Some(Fragment::Send(fragment))
    }
}

fn build(header: AclHeader, data: &[u8], link: LinkType) -> Option<HciPacket> {
    let mut bytes: Vec<u8, MAX_HCI_PACKET_SIZE> = Vec::new();
    bytes.extend_from_slice(&header.to_bytes()).ok()?;
    bytes.extend_from_slice(data).ok()?;
    HciPacket::acl(link, &bytes).ok()
}

#[derive(Debug)]
struct Partial {
    expected: usize,
    header: AclHeader,
    link: LinkType,
    buffer: Vec<u8, MAX_HCI_PACKET_SIZE>,
}

impl Partial {
    fn accumulated(&self) -> usize {
        self.buffer.len()
    }
}

/// Reassembles inbound ACL fragments per connection handle
#[derive(Debug, Default)]
pub struct AclReassembler {
    partials: FnvIndexMap<u16, Partial, MAX_PARTIAL_PACKETS>,
}

impl AclReassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self {
            partials: FnvIndexMap::new(),
        }
    }

    /// Number of handles with a partially received PDU
    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.partials.len()
    }

    /// Offer an inbound packet, returning it once a complete PDU is available.
    ///
    /// Packets other than ACL are returned untouched.
    pub fn reassemble(&mut self, packet: HciPacket) -> Option<HciPacket> {
        if packet.kind() != PacketKind::AclData {
            return Some(packet);
        }
        let Ok(header) = AclHeader::from_bytes(packet.as_bytes()) else {
            warn!("[FRAG] ACL packet without header, dropping");
            return None;
        };
        let handle = header.handle;
        let payload = packet.payload();
        let payload = &payload[..payload.len().min(usize::from(header.data_length))];

        if header.packet_boundary.is_start() {
            if self.partials.remove(&handle).is_some() {
                warn!(
                    "[FRAG] New start on handle {:#x} before previous PDU completed, discarding it",
                    handle
                );
            }

            let [lo, hi, ..] = *payload else {
                warn!("[FRAG] Start fragment on handle {:#x} too short", handle);
                return None;
            };
            let expected = usize::from(u16::from_le_bytes([lo, hi])) + L2CAP_HEADER_LEN;
            if payload.len() >= expected {
                return Some(packet);
            }
            if expected + AclHeader::SIZE > MAX_HCI_PACKET_SIZE {
                warn!(
                    "[FRAG] PDU of {} bytes on handle {:#x} exceeds buffer, dropping",
                    expected,
                    handle
                );
                return None;
            }

            let mut buffer = Vec::new();
            // Fits: payload is shorter than expected
            let _ = buffer.extend_from_slice(payload);
            let partial = Partial {
                expected,
                header,
                link: packet.link(),
                buffer,
            };
            if self.partials.insert(handle, partial).is_err() {
                warn!("[FRAG] Too many partial PDUs, dropping handle {:#x}", handle);
            }
            return None;
        }

        let Some(partial) = self.partials.get_mut(&handle) else {
            warn!(
                "[FRAG] Continuation on handle {:#x} without a start, dropping",
                handle
            );
            return None;
        };

        let room = partial.expected - partial.accumulated();
        if payload.len() > room {
            error!(
                "[FRAG] Continuation on handle {:#x} overflows PDU by {} bytes, truncating",
                handle,
                payload.len() - room
            );
        }
        let _ = partial
            .buffer
            .extend_from_slice(&payload[..payload.len().min(room)]);
        if partial.accumulated() < partial.expected {
            return None;
        }

        let partial = self.partials.remove(&handle)?;
        let header = partial
            .header
            .fragment(partial.header.packet_boundary, partial.expected as u16);
        trace!(
            "[FRAG] Reassembled {} bytes on handle {:#x}",
            partial.expected,
            handle
        );
        build(header, &partial.buffer, partial.link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::acl::BroadcastFlag;

    fn acl(handle: u16, boundary: PacketBoundary, data: &[u8]) -> HciPacket {
        let header = AclHeader::new(
            handle,
            boundary,
            BroadcastFlag::PointToPoint,
            data.len() as u16,
        );
        build(header, data, LinkType::Classic).unwrap()
    }

    fn l2cap(len: usize) -> Vec<u8, 512> {
        let mut pdu = Vec::new();
        pdu.extend_from_slice(&(len as u16).to_le_bytes()).unwrap();
        pdu.extend_from_slice(&[0x40, 0x00]).unwrap();
        for i in 0..len {
            pdu.push(i as u8).unwrap();
        }
        pdu
    }

    fn drain(fragmenter: &mut AclFragmenter) -> Vec<HciPacket, 16> {
        let mut out = Vec::new();
        while let Some(Fragment::Send(packet)) = fragmenter.next_fragment() {
            out.push(packet).unwrap();
        }
        out
    }

    #[test]
    fn test_small_packet_sent_whole() {
        let mut fragmenter = AclFragmenter::new(27, 27);
        let packet = acl(0x0040, PacketBoundary::FirstNonFlushable, &l2cap(10));

        fragmenter.start(packet.clone()).unwrap();
        assert_eq!(fragmenter.next_fragment(), Some(Fragment::Send(packet)));
        assert!(!fragmenter.is_busy());
    }

    #[test]
    fn test_fragments_respect_size_and_concatenate() {
        let mut fragmenter = AclFragmenter::new(27, 0);
        let pdu = l2cap(96);
        fragmenter
            .start(acl(0x0040, PacketBoundary::FirstFlushable, &pdu))
            .unwrap();

        let fragments = drain(&mut fragmenter);
        assert_eq!(fragments.len(), 4);

        let mut joined: Vec<u8, 512> = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let header = AclHeader::from_bytes(fragment.as_bytes()).unwrap();
            assert!(fragment.payload().len() <= 27);
            assert_eq!(usize::from(header.data_length), fragment.payload().len());
            assert_eq!(header.handle, 0x0040);
            let expected = if i == 0 {
                PacketBoundary::FirstFlushable
            } else {
                PacketBoundary::ContinuingFragment
            };
            assert_eq!(header.packet_boundary, expected);
            joined.extend_from_slice(fragment.payload()).unwrap();
        }
        assert_eq!(joined, pdu);
    }

    #[test]
    fn test_le_falls_back_to_classic_size() {
        let fragmenter = AclFragmenter::new(1021, 0);
        assert_eq!(fragmenter.max_fragment(LinkType::Le), 1021);

        let mut fragmenter = AclFragmenter::new(1021, 27);
        assert_eq!(fragmenter.max_fragment(LinkType::Le), 27);
        assert_eq!(fragmenter.max_fragment(LinkType::Classic), 1021);

        let packet = HciPacket::acl(
            LinkType::Le,
            acl(0x0001, PacketBoundary::FirstNonFlushable, &l2cap(40)).as_bytes(),
        )
        .unwrap();
        fragmenter.start(packet).unwrap();
        assert_eq!(drain(&mut fragmenter).len(), 2);
    }

    #[test]
    fn test_segment_budget_requeues_remainder() {
        let mut fragmenter = AclFragmenter::new(20, 0);
        let pdu = l2cap(76);
        let packet = acl(0x0002, PacketBoundary::FirstNonFlushable, &pdu).with_segment_budget(2);
        fragmenter.start(packet).unwrap();

        assert!(matches!(fragmenter.next_fragment(), Some(Fragment::Send(_))));
        assert!(matches!(fragmenter.next_fragment(), Some(Fragment::Send(_))));
        let Some(Fragment::Requeue(rest)) = fragmenter.next_fragment() else {
            panic!("expected requeue");
        };
        assert!(!fragmenter.is_busy());

        let header = AclHeader::from_bytes(rest.as_bytes()).unwrap();
        assert_eq!(header.packet_boundary, PacketBoundary::ContinuingFragment);
        assert_eq!(rest.payload(), &pdu[40..]);
        assert_eq!(rest.segment_budget(), 0);
    }

    #[test]
    fn test_start_rejects_non_acl_and_busy() {
        let mut fragmenter = AclFragmenter::new(20, 0);
        let event = HciPacket::new(PacketKind::Event, &[0x13, 0x00]).unwrap();
        assert_eq!(fragmenter.start(event), Err(HciError::InvalidPacketType));

        fragmenter
            .start(acl(0x0002, PacketBoundary::FirstNonFlushable, &l2cap(40)))
            .unwrap();
        fragmenter.next_fragment().unwrap();
        assert_eq!(
            fragmenter.start(acl(0x0003, PacketBoundary::FirstNonFlushable, &l2cap(4))),
            Err(HciError::QueueFull)
        );
    }

    #[test]
    fn test_reassembly_fast_path() {
        let mut reassembler = AclReassembler::new();
        let packet = acl(0x0040, PacketBoundary::FirstFlushable, &l2cap(8));
        assert_eq!(reassembler.reassemble(packet.clone()), Some(packet));
        assert_eq!(reassembler.in_progress(), 0);

        let event = HciPacket::new(PacketKind::Event, &[0x13, 0x00]).unwrap();
        assert_eq!(reassembler.reassemble(event.clone()), Some(event));
    }

    #[test]
    fn test_reassembly_of_fragments() {
        let mut fragmenter = AclFragmenter::new(27, 0);
        let mut reassembler = AclReassembler::new();
        let pdu = l2cap(96);
        let original = acl(0x0040, PacketBoundary::FirstFlushable, &pdu);
        fragmenter.start(original.clone()).unwrap();

        let fragments = drain(&mut fragmenter);
        let (last, init) = fragments.split_last().unwrap();
        for fragment in init {
            assert!(reassembler.reassemble(fragment.clone()).is_none());
        }
        assert_eq!(reassembler.in_progress(), 1);
        assert_eq!(reassembler.reassemble(last.clone()), Some(original));
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_reassembly_keeps_start_link() {
        let mut fragmenter = AclFragmenter::new(27, 27);
        let mut reassembler = AclReassembler::new();
        let pdu = l2cap(40);
        let header = AclHeader::new(
            0x0041,
            PacketBoundary::FirstNonFlushable,
            BroadcastFlag::PointToPoint,
            pdu.len() as u16,
        );
        let original = build(header, &pdu, LinkType::Le).unwrap();
        fragmenter.start(original.clone()).unwrap();

        let fragments = drain(&mut fragmenter);
        assert_eq!(fragments.len(), 2);
        assert!(reassembler.reassemble(fragments[0].clone()).is_none());
        let whole = reassembler.reassemble(fragments[1].clone()).unwrap();
        assert_eq!(whole.link(), LinkType::Le);
        assert_eq!(whole, original);
    }

    #[test]
    fn test_reassembly_stale_and_orphan() {
        let mut reassembler = AclReassembler::new();
        let pdu = l2cap(30);

        // Orphan continuation is dropped
        assert!(
            reassembler
                .reassemble(acl(0x0001, PacketBoundary::ContinuingFragment, &pdu[..10]))
                .is_none()
        );
        assert_eq!(reassembler.in_progress(), 0);

        // A restart replaces the stale entry
        reassembler.reassemble(acl(0x0001, PacketBoundary::FirstFlushable, &pdu[..10]));
        reassembler.reassemble(acl(0x0001, PacketBoundary::FirstFlushable, &pdu[..20]));
        assert_eq!(reassembler.in_progress(), 1);
        let done = reassembler
            .reassemble(acl(0x0001, PacketBoundary::ContinuingFragment, &pdu[20..]))
            .unwrap();
        assert_eq!(done.payload(), pdu.as_slice());
    }

    #[test]
    fn test_reassembly_truncates_overflow() {
        let mut reassembler = AclReassembler::new();
        let pdu = l2cap(16);
        reassembler.reassemble(acl(0x0003, PacketBoundary::FirstFlushable, &pdu[..10]));

        let mut tail: Vec<u8, 32> = Vec::from_slice(&pdu[10..]).unwrap();
        tail.extend_from_slice(&[0xEE; 5]).unwrap();
        let done = reassembler
            .reassemble(acl(0x0003, PacketBoundary::ContinuingFragment, &tail))
            .unwrap();
        assert_eq!(done.payload(), pdu.as_slice());
        let header = AclHeader::from_bytes(done.as_bytes()).unwrap();
        assert_eq!(usize::from(header.data_length), pdu.len());
    }
}
