//! BLE Mesh Lower Transport Layer
//!
//! This module implements segmentation, reassembly and reliable delivery of
//! upper transport PDUs over the Mesh network layer, together with the Replay
//! Protection List that guards every inbound message.
//!
//! The engines in this module are synchronous state machines. Every operation
//! that arms or inspects a timer takes the current [`Instant`] explicitly; the
//! async [`processor`](crate::processor) supplies it and sleeps until the next
//! deadline reported by [`transport::MeshTransport::next_deadline`].
//!
//! Collaborators outside the transport layer are reached through traits:
//!
//! * [`NetworkLayer`]: encrypts and transmits lower transport PDUs, owns the
//!   sequence number and IV index, and fronts the Friend Queue.
//! * [`UpperLayer`]: receives reassembled PDUs and send completions.
//! * [`replay::ReplayStore`]: persists Replay Protection List changes.

pub mod pdu;
pub mod replay;
pub mod seg_rx;
pub mod seg_tx;
pub mod transport;

use crate::constants::{
    DEFAULT_TTL, RX_SDU_MAX, SEG_RETRANSMIT_ATTEMPTS, SEG_RETRANSMIT_GROUP_MS,
    SEG_RETRANSMIT_UNICAST_BASE_MS, SEG_RX_INCOMPLETE_BASE_MS, SEG_RX_INCOMPLETE_MAX_MS,
};
use crate::pool::SlotHandle;

/// Mesh addresses and address classification
pub mod addr {
    /// Unassigned address
    pub const UNASSIGNED: u16 = 0x0000;
    /// All-proxies fixed group address
    pub const ALL_PROXIES: u16 = 0xFFFC;
    /// All-nodes fixed group address
    pub const ALL_NODES: u16 = 0xFFFF;

    /// Whether `addr` is a unicast element address
    #[must_use]
    pub const fn is_unicast(addr: u16) -> bool {
        addr != UNASSIGNED && addr & 0x8000 == 0
    }

    /// Whether `addr` is a virtual address
    #[must_use]
    pub const fn is_virtual(addr: u16) -> bool {
        addr & 0xC000 == 0x8000
    }

    /// Whether `addr` is a group address
    #[must_use]
    pub const fn is_group(addr: u16) -> bool {
        addr & 0xC000 == 0xC000
    }
}

/// Compose a 64-bit `SeqAuth` from an IV index and a 24-bit sequence number.
#[must_use]
pub const fn seq_auth(iv_index: u32, seq: u32) -> u64 {
    ((iv_index as u64) << 24) | (seq as u64 & 0x00FF_FFFF)
}

/// Caller-chosen identifier echoed back in send completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageTag(pub u32);

/// Parameters of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetTx {
    /// Network key index
    pub net_idx: u16,
    /// Source element address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// TTL, or [`TTL_DEFAULT`](crate::constants::TTL_DEFAULT) for the network default
    pub ttl: u8,
    /// Application key flag (`false` for device-key messages)
    pub akf: bool,
    /// Application key identifier
    pub aid: u8,
    /// Use a 64-bit `TransMIC` (segmented access messages only)
    pub aszmic: bool,
    /// Use the new network key during a key refresh
    pub new_key: bool,
    /// Force segmentation even when the PDU would fit unsegmented
    pub force_segmented: bool,
}

impl NetTx {
    /// Create parameters for an access message with default flags
    #[must_use]
    pub fn new(net_idx: u16, src: u16, dst: u16, ttl: u8) -> Self {
        Self {
            net_idx,
            src,
            dst,
            ttl,
            akf: false,
            aid: 0,
            aszmic: false,
            new_key: false,
            force_segmented: false,
        }
    }

    /// Use the application key identified by `aid`
    #[must_use]
    pub fn with_app_key(mut self, aid: u8) -> Self {
        self.akf = true;
        self.aid = aid & 0x3F;
        self
    }

    /// Always segment this message
    #[must_use]
    pub fn segmented(mut self) -> Self {
        self.force_segmented = true;
        self
    }
}

/// Metadata of an inbound network PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetRx {
    /// Network key index the PDU was decrypted with
    pub net_idx: u16,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// 24-bit network sequence number
    pub seq: u32,
    /// IV index the PDU was decrypted with
    pub iv_index: u32,
    /// Received TTL
    pub ttl: u8,
    /// Control (`true`) or access (`false`) message
    pub ctl: bool,
    /// PDU used the previous IV index
    pub old_iv: bool,
    /// Destination matches a local element
    pub local_match: bool,
    /// Destination matches a Low Power Node befriended by this node
    pub friend_match: bool,
    /// PDU originated on the local interface
    pub local_iface: bool,
}

/// Identifies a PDU handed to the network layer so it can report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendToken {
    /// No completion report is needed
    None,
    /// One segment of a segmented message
    Segment {
        /// TX context slot
        slot: SlotHandle,
        /// Segment offset
        seg_o: u8,
    },
    /// An unsegmented message with caller callbacks
    Single(MessageTag),
}

/// Mesh lower transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No free context, or a message to the same destination is in flight
    Busy,
    /// Admission control rejected the message (Friend Queue full)
    NoResources,
    /// Retransmission attempts exhausted, or an incomplete message was discarded
    Timeout,
    /// The receiver canceled the message with a zero acknowledgment
    Canceled,
    /// Sequence number already seen for this source
    Replay,
    /// PDU or SDU length out of range
    InvalidLength,
    /// Malformed header or sequence reconstruction failure
    InvalidFraming,
    /// Header fields inconsistent with the message being reassembled
    ProtocolViolation,
    /// Message already fully received
    Already,
    /// Acknowledgment matches no outbound message
    UnknownContext,
    /// The network layer refused a PDU
    SendFailed,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "Segmentation context busy"),
            Self::NoResources => write!(f, "Insufficient Friend Queue space"),
            Self::Timeout => write!(f, "Retransmission attempts exhausted"),
            Self::Canceled => write!(f, "Message canceled by receiver"),
            Self::Replay => write!(f, "Replayed message"),
            Self::InvalidLength => write!(f, "Invalid message length"),
            Self::InvalidFraming => write!(f, "Invalid message framing"),
            Self::ProtocolViolation => write!(f, "Inconsistent segment header"),
            Self::Already => write!(f, "Message already received"),
            Self::UnknownContext => write!(f, "No matching transmission"),
            Self::SendFailed => write!(f, "Network layer send failed"),
        }
    }
}

/// Downstream collaborator: the Mesh network layer.
///
/// `send` copies the PDU; the network layer later reports the progress of
/// tokens other than [`SendToken::None`] through
/// [`MeshTransport::on_send_start`](transport::MeshTransport::on_send_start) and
/// [`MeshTransport::on_send_end`](transport::MeshTransport::on_send_end).
pub trait NetworkLayer {
    /// IV index used for transmission
    fn iv_index(&self) -> u32;

    /// Sequence number the next transmitted PDU will carry
    fn next_seq(&self) -> u32;

    /// Network default TTL
    fn default_ttl(&self) -> u8 {
        DEFAULT_TTL
    }

    /// Primary element address, used as the source of on-behalf-of acks
    fn primary_addr(&self) -> u16;

    /// Encrypt and transmit one lower transport PDU.
    ///
    /// # Errors
    ///
    /// Returns an error if no network buffer is available.
    fn send(&mut self, tx: &NetTx, pdu: &[u8], token: SendToken) -> Result<(), TransportError>;

    /// Whether the Friend Queue for `tx.dst` can take `segments` more PDUs
    fn friend_queue_has_space(&self, _tx: &NetTx, _seq_auth: Option<u64>, _segments: u8) -> bool {
        true
    }

    /// Offer a PDU to the Friend Queue, returning `true` if it was queued
    fn friend_enqueue(
        &mut self,
        _tx: &NetTx,
        _seq_auth: Option<u64>,
        _segments: u8,
        _pdu: &[u8],
    ) -> bool {
        false
    }

    /// Continue an IV update that was deferred while segmented TX was active
    fn resume_iv_update(&mut self) {}
}

/// Upstream collaborator: the upper transport / access layer.
pub trait UpperLayer {
    /// First transmission of a message started
    fn send_start(&mut self, tag: MessageTag, duration: u16, result: Result<(), TransportError>);

    /// Message finished; called exactly once per accepted send
    fn send_end(&mut self, tag: MessageTag, result: Result<(), TransportError>);

    /// Complete access PDU (still encrypted) received
    fn recv_access(&mut self, rx: &NetRx, seq_auth: u64, hdr: u8, aszmic: bool, pdu: &[u8]);

    /// Control message other than a Segment Acknowledgment received
    fn recv_control(&mut self, rx: &NetRx, opcode: u8, payload: &[u8]);
}

/// Runtime options for the transport engines
///
/// # Examples
///
/// ```rust
/// use meshbird::mesh::MeshOptions;
///
/// let options = MeshOptions {
///     retransmit_attempts: 2,
///     ..MeshOptions::default()
/// };
/// assert_eq!(options.retransmit_attempts, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeshOptions {
    /// Retransmission rounds after the initial send
    pub retransmit_attempts: u8,
    /// Base of the unicast retransmission interval in milliseconds
    pub unicast_retransmit_base_ms: u64,
    /// Group retransmission interval in milliseconds
    pub group_retransmit_ms: u64,
    /// Base of the incomplete-message timeout in milliseconds
    pub rx_incomplete_base_ms: u64,
    /// Upper bound of the incomplete-message timeout in milliseconds
    pub rx_incomplete_max_ms: u64,
    /// Largest SDU accepted for reassembly, capped at [`RX_SDU_MAX`]
    pub rx_sdu_max: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            retransmit_attempts: SEG_RETRANSMIT_ATTEMPTS,
            unicast_retransmit_base_ms: SEG_RETRANSMIT_UNICAST_BASE_MS,
            group_retransmit_ms: SEG_RETRANSMIT_GROUP_MS,
            rx_incomplete_base_ms: SEG_RX_INCOMPLETE_BASE_MS,
            rx_incomplete_max_ms: SEG_RX_INCOMPLETE_MAX_MS,
            rx_sdu_max: RX_SDU_MAX,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborators shared by the mesh unit tests.

    use super::{MessageTag, NetRx, NetTx, NetworkLayer, SendToken, TransportError, UpperLayer};
    use crate::constants::{RX_SDU_MAX, SEG_PDU_MAX};
    use heapless::Vec;

    #[derive(Debug, Clone)]
    pub struct SentPdu {
        pub tx: NetTx,
        pub seq: u32,
        pub pdu: Vec<u8, SEG_PDU_MAX>,
        pub token: SendToken,
    }

    #[derive(Debug)]
    pub struct MockNetwork {
        pub iv_index: u32,
        pub seq: u32,
        pub sent: Vec<SentPdu, 64>,
        pub fail_sends: bool,
        pub friend_space: bool,
        pub friend_queue: bool,
        pub iv_resumed: u32,
    }

    impl Default for MockNetwork {
        fn default() -> Self {
            Self {
                iv_index: 0,
                seq: 0x100,
                sent: Vec::new(),
                fail_sends: false,
                friend_space: true,
                friend_queue: false,
                iv_resumed: 0,
            }
        }
    }

    impl MockNetwork {
        pub fn take_sent(&mut self) -> Vec<SentPdu, 64> {
            core::mem::take(&mut self.sent)
        }
    }

    impl NetworkLayer for MockNetwork {
        fn iv_index(&self) -> u32 {
            self.iv_index
        }

        fn next_seq(&self) -> u32 {
            self.seq
        }

        fn primary_addr(&self) -> u16 {
            0x0001
        }

        fn send(&mut self, tx: &NetTx, pdu: &[u8], token: SendToken) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::SendFailed);
            }
            let seq = self.seq;
            self.seq += 1;
            self.sent
                .push(SentPdu {
                    tx: *tx,
                    seq,
                    pdu: Vec::from_slice(pdu).unwrap(),
                    token,
                })
                .unwrap();
            Ok(())
        }

        fn friend_queue_has_space(&self, _tx: &NetTx, _seq_auth: Option<u64>, _segments: u8) -> bool {
            self.friend_space
        }

        fn friend_enqueue(
            &mut self,
            _tx: &NetTx,
            _seq_auth: Option<u64>,
            _segments: u8,
            _pdu: &[u8],
        ) -> bool {
            self.friend_queue
        }

        fn resume_iv_update(&mut self) {
            self.iv_resumed += 1;
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum UpperEvent {
        Start(MessageTag, Result<(), TransportError>),
        End(MessageTag, Result<(), TransportError>),
        Access {
            src: u16,
            seq_auth: u64,
            hdr: u8,
            pdu: Vec<u8, RX_SDU_MAX>,
        },
        Control {
            src: u16,
            opcode: u8,
            payload: Vec<u8, RX_SDU_MAX>,
        },
    }

    #[derive(Debug, Default)]
    pub struct MockUpper {
        pub events: Vec<UpperEvent, 32>,
    }

    impl MockUpper {
        pub fn ends(&self) -> impl Iterator<Item = &UpperEvent> {
            self.events
                .iter()
                .filter(|event| matches!(event, UpperEvent::End(..)))
        }
    }

    impl UpperLayer for MockUpper {
        fn send_start(&mut self, tag: MessageTag, _duration: u16, result: Result<(), TransportError>) {
            self.events.push(UpperEvent::Start(tag, result)).unwrap();
        }

        fn send_end(&mut self, tag: MessageTag, result: Result<(), TransportError>) {
            self.events.push(UpperEvent::End(tag, result)).unwrap();
        }

        fn recv_access(&mut self, rx: &NetRx, seq_auth: u64, hdr: u8, _aszmic: bool, pdu: &[u8]) {
            self.events
                .push(UpperEvent::Access {
                    src: rx.src,
                    seq_auth,
                    hdr,
                    pdu: Vec::from_slice(pdu).unwrap(),
                })
                .unwrap();
        }

        fn recv_control(&mut self, rx: &NetRx, opcode: u8, payload: &[u8]) {
            self.events
                .push(UpperEvent::Control {
                    src: rx.src,
                    opcode,
                    payload: Vec::from_slice(payload).unwrap(),
                })
                .unwrap();
        }
    }
}
