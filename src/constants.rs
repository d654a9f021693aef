//! `Meshbird` Constants
//!
//! This module contains all the constants used throughout the `Meshbird` library.
//! These constants define pool capacities, PDU geometry, timer parameters and
//! HCI buffer limits. Pool capacities are compile-time fixed so that memory use
//! stays bounded regardless of peer behaviour.

// ---------------------------------------------------------------------------
// Mesh lower transport geometry
// ---------------------------------------------------------------------------

/// Maximum number of concurrently transmitted segmented messages
pub const TX_SEG_MSG_COUNT: usize = 4;

/// Maximum number of concurrently reassembled segmented messages
pub const RX_SEG_MSG_COUNT: usize = 4;

/// Maximum number of segments in one segmented message (`SegN` is 5 bits)
pub const TX_SEG_MAX: usize = 32;

/// Segment payload length for access messages
pub const APP_SEG_SDU_MAX: usize = 12;

/// Segment payload length for control messages
pub const CTL_SEG_SDU_MAX: usize = 8;

/// Largest access PDU (including `TransMIC`) that fits an unsegmented message
pub const APP_UNSEG_SDU_MAX: usize = 15;

/// Largest control PDU payload that fits an unsegmented message
pub const CTL_UNSEG_SDU_MAX: usize = 11;

/// Largest upper transport PDU that can be segmented
pub const TX_SDU_MAX: usize = TX_SEG_MAX * APP_SEG_SDU_MAX;

/// Reassembly buffer capacity per inbound context
pub const RX_SDU_MAX: usize = 384;

/// Segmented lower transport header length
pub const SEG_HDR_LEN: usize = 4;

/// Largest segmented lower transport PDU (header + payload)
pub const SEG_PDU_MAX: usize = SEG_HDR_LEN + APP_SEG_SDU_MAX;

/// Largest unsegmented lower transport PDU (header + payload)
pub const UNSEG_PDU_MAX: usize = 1 + APP_UNSEG_SDU_MAX;

/// Largest lower transport PDU, segmented or not
pub const TRANSPORT_PDU_MAX: usize = if SEG_PDU_MAX > UNSEG_PDU_MAX {
    SEG_PDU_MAX
} else {
    UNSEG_PDU_MAX
};

/// Segment Acknowledgment payload length
pub const SEG_ACK_LEN: usize = 6;

/// Mask applied to sequence numbers to obtain `SeqZero`
pub const SEQ_ZERO_MASK: u16 = 0x1FFF;

/// Number of entries in the Replay Protection List
pub const RPL_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Mesh timers
// ---------------------------------------------------------------------------

/// Retransmission attempts after the initial send of a segmented message
pub const SEG_RETRANSMIT_ATTEMPTS: u8 = 4;

/// Lower bound of the unicast retransmission interval in milliseconds
pub const SEG_RETRANSMIT_UNICAST_MIN_MS: u64 = 400;

/// Base of the unicast retransmission interval in milliseconds
pub const SEG_RETRANSMIT_UNICAST_BASE_MS: u64 = 200;

/// Per-hop increment of the unicast retransmission interval in milliseconds
pub const SEG_RETRANSMIT_PER_HOP_MS: u64 = 50;

/// Fixed retransmission interval for group and virtual destinations
pub const SEG_RETRANSMIT_GROUP_MS: u64 = 50;

/// Base of the incomplete-message timeout in milliseconds
pub const SEG_RX_INCOMPLETE_BASE_MS: u64 = 10_000;

/// Per-hop increment of the incomplete-message timeout in milliseconds
pub const SEG_RX_INCOMPLETE_PER_HOP_MS: u64 = 100;

/// Upper bound of the incomplete-message timeout in milliseconds
pub const SEG_RX_INCOMPLETE_MAX_MS: u64 = 60_000;

/// Lower bound of the acknowledgment delay in milliseconds
pub const SEG_ACK_MIN_MS: u64 = 400;

/// Base of the acknowledgment delay in milliseconds
pub const SEG_ACK_BASE_MS: u64 = 150;

/// Per-hop increment of the acknowledgment delay in milliseconds
pub const SEG_ACK_PER_HOP_MS: u64 = 50;

/// Per-missing-segment increment of the acknowledgment delay in milliseconds
pub const SEG_ACK_PER_MISSING_MS: u64 = 100;

/// Network default TTL marker, resolved by the network layer
pub const TTL_DEFAULT: u8 = 0xFF;

/// Default TTL used when the network layer does not provide one
pub const DEFAULT_TTL: u8 = 7;

// ---------------------------------------------------------------------------
// HCI
// ---------------------------------------------------------------------------

/// Command credits granted before the controller reports its own count
pub const INITIAL_COMMAND_CREDITS: u8 = 1;

/// Watchdog timeout for an outstanding HCI command in milliseconds
pub const COMMAND_TIMEOUT_MS: u64 = 8_000;

/// Pause before reading again after the controller stream failed
pub const HCI_READ_RETRY_MS: u64 = 100;

/// Depth of the host-to-controller command queue
pub const COMMAND_QUEUE_SIZE: usize = 8;

/// Maximum number of commands awaiting a controller response
pub const MAX_PENDING_COMMANDS: usize = 4;

/// Depth of the host-to-controller ACL packet queue
pub const PACKET_QUEUE_SIZE: usize = 8;

/// Largest command packet (opcode + length + 255 parameter bytes)
pub const MAX_COMMAND_SIZE: usize = 258;

/// Largest return parameter block carried by a Command Complete event
pub const MAX_RETURN_PARAMS: usize = 252;

/// Largest HCI packet handled by the host, excluding the H4 indicator
pub const MAX_HCI_PACKET_SIZE: usize = 1028;

/// Default classic ACL data length before the controller reports its own
pub const DEFAULT_ACL_DATA_SIZE_CLASSIC: u16 = 1021;

/// Default LE ACL data length before the controller reports its own
pub const DEFAULT_ACL_DATA_SIZE_LE: u16 = 251;

/// Maximum number of connection handles with a partially reassembled packet
///
/// Must be a power of two (`FnvIndexMap` requirement).
pub const MAX_PARTIAL_PACKETS: usize = 4;

/// Size of the buffer used for reading the HCI byte stream
pub const READ_BUFFER_SIZE: usize = 256;

/// Depth of the channels between the processor tasks
pub const MAX_CHANNELS: usize = 8;
