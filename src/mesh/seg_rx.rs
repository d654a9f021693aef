//! Segmented message reassembly
//!
//! [`SegmentReassembler`] collects the segments of inbound messages into
//! fixed-size buffers, acknowledges them to unicast senders and hands the
//! complete PDU to the upper layer.
//!
//! A context that finished reassembly keeps its identity (source, destination,
//! `SeqAuth` and block) after it is released, so a late retransmission of an
//! already delivered message can be answered with a fresh acknowledgment
//! instead of being reassembled twice.

use super::pdu::{SegmentAck, SegmentHeader, block_complete, ctl_hdr, ctl_op, ctl_opcode};
use super::replay::{ReplayCheck, ReplayProtectionList, ReplayStore};
use super::{
    MeshOptions, NetRx, NetTx, NetworkLayer, SendToken, TransportError, UpperLayer, addr, seq_auth,
};
use crate::constants::{
    APP_SEG_SDU_MAX, CTL_SEG_SDU_MAX, RX_SDU_MAX, RX_SEG_MSG_COUNT, SEG_ACK_BASE_MS, SEG_ACK_MIN_MS,
    SEG_ACK_PER_HOP_MS, SEG_ACK_PER_MISSING_MS, SEG_RX_INCOMPLETE_PER_HOP_MS, SEQ_ZERO_MASK,
};
use crate::pool::{Pool, Reusable, SlotHandle};
use embassy_time::{Duration, Instant};
use heapless::Vec;

/// Result of accepting a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxOutcome {
    /// Segment stored (or already present); more segments are missing
    Partial,
    /// The message was complete and has been delivered
    Complete,
}

/// State of one inbound segmented message
#[derive(Debug, Default)]
pub struct RxContext {
    net_idx: u16,
    src: u16,
    dst: u16,
    seq_auth: u64,
    hdr: u8,
    szmic: bool,
    seg_n: u8,
    ctl: bool,
    ttl: u8,
    obo: bool,
    block: u32,
    buf: Vec<u8, RX_SDU_MAX>,
    len: usize,
    in_use: bool,
    incomplete_at: Option<Instant>,
    ack_at: Option<Instant>,
    last_ack: Option<Instant>,
}

impl Reusable for RxContext {
    fn is_free(&self) -> bool {
        !self.in_use
    }
}

impl RxContext {
    /// Source address of the message
    #[must_use]
    pub fn source(&self) -> u16 {
        self.src
    }

    /// Destination the message was addressed to
    #[must_use]
    pub fn destination(&self) -> u16 {
        self.dst
    }

    /// `SeqAuth` of the message
    #[must_use]
    pub fn seq_auth(&self) -> u64 {
        self.seq_auth
    }

    /// Bitmap of received segments
    #[must_use]
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Number of segments in the message
    #[must_use]
    pub fn segment_count(&self) -> u8 {
        self.seg_n + 1
    }

    /// Number of distinct segments received so far
    #[must_use]
    pub fn received_count(&self) -> u8 {
        self.block.count_ones() as u8
    }

    fn missing_count(&self) -> u8 {
        self.segment_count() - self.received_count()
    }

    fn is_complete(&self) -> bool {
        self.block == block_complete(self.seg_n)
    }
}

/// Addressing of a Segment Acknowledgment
#[derive(Debug, Clone, Copy)]
struct AckTarget {
    net_idx: u16,
    /// Address the segments were sent to
    local: u16,
    /// Sender of the segments
    peer: u16,
    /// TTL the segments arrived with
    recv_ttl: u8,
    obo: bool,
}

impl AckTarget {
    fn from_rx(rx: &NetRx, obo: bool) -> Self {
        Self {
            net_idx: rx.net_idx,
            local: rx.dst,
            peer: rx.src,
            recv_ttl: rx.ttl,
            obo,
        }
    }

    fn from_context(ctx: &RxContext) -> Self {
        Self {
            net_idx: ctx.net_idx,
            local: ctx.dst,
            peer: ctx.src,
            recv_ttl: ctx.ttl,
            obo: ctx.obo,
        }
    }

    fn send(self, net: &mut impl NetworkLayer, seq_auth: u64, block: u32) {
        if !addr::is_unicast(self.local) {
            debug!("[SEG_RX] Not sending ack for non-unicast address");
            return;
        }

        let ttl = if self.recv_ttl == 0 { 0 } else { net.default_ttl() };
        let src = if self.obo { net.primary_addr() } else { self.local };
        let tx = NetTx::new(self.net_idx, src, self.peer, ttl);
        let ack = SegmentAck {
            obo: self.obo,
            seq_zero: seq_auth as u16 & SEQ_ZERO_MASK,
            block,
        };

        let mut pdu = [0u8; 1 + SegmentAck::SIZE];
        pdu[0] = ctl_hdr(ctl_op::ACK, false);
        pdu[1..].copy_from_slice(&ack.to_bytes());

        debug!(
            "[SEG_RX] Ack SeqZero {:#x} Block {:#x} OBO {}",
            ack.seq_zero, block, self.obo
        );
        if let Err(err) = net.send(&tx, &pdu, SendToken::None) {
            warn!("[SEG_RX] Sending ack failed: {:?}", err);
        }
    }
}

fn seg_len(ctl: bool) -> usize {
    if ctl { CTL_SEG_SDU_MAX } else { APP_SEG_SDU_MAX }
}

/// Acknowledgment delay for a sender `ttl` hops away with `missing` segments
/// outstanding
#[must_use]
pub fn ack_timeout(ttl: u8, missing: u8) -> Duration {
    let ms = SEG_ACK_BASE_MS
        + SEG_ACK_PER_HOP_MS * u64::from(ttl)
        + SEG_ACK_PER_MISSING_MS * u64::from(missing);
    Duration::from_millis(ms.max(SEG_ACK_MIN_MS))
}

fn incomplete_timeout(options: &MeshOptions, ttl: u8, seg_n: u8, received: u8) -> Duration {
    let base = (options.rx_incomplete_base_ms + SEG_RX_INCOMPLETE_PER_HOP_MS * u64::from(ttl))
        .min(options.rx_incomplete_max_ms);
    let shrink = base * u64::from(received) / (2 * (u64::from(seg_n) + 1));
    Duration::from_millis(base - shrink)
}

/// Pool of inbound reassembly contexts
#[derive(Debug)]
pub struct SegmentReassembler<const N: usize = RX_SEG_MSG_COUNT> {
    pool: Pool<RxContext, N>,
    options: MeshOptions,
}

impl<const N: usize> Default for SegmentReassembler<N> {
    fn default() -> Self {
        Self::new(MeshOptions::default())
    }
}

impl<const N: usize> SegmentReassembler<N> {
    /// Create a reassembler with every context free
    #[must_use]
    pub fn new(options: MeshOptions) -> Self {
        Self {
            pool: Pool::new(),
            options,
        }
    }

    fn max_sdu_len(&self) -> usize {
        self.options.rx_sdu_max.min(RX_SDU_MAX)
    }

    /// Time an incomplete message may wait for its next segment.
    ///
    /// Starts at `base + 100 ms * ttl` (capped) and shrinks towards half of
    /// that as more of the `seg_n + 1` segments arrive.
    #[must_use]
    pub fn incomplete_timeout(&self, ttl: u8, seg_n: u8, received: u8) -> Duration {
        incomplete_timeout(&self.options, ttl, seg_n, received)
    }

    /// Process one segmented lower transport PDU.
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidLength`] for a truncated PDU, a wrong
    ///   segment size or an SDU above the reassembly limit (the sender is
    ///   told with a zero acknowledgment)
    /// * [`TransportError::InvalidFraming`] if `SegO > SegN` or `SeqAuth`
    ///   cannot be reconstructed
    /// * [`TransportError::Replay`] for a replayed PDU or an older `SeqAuth`
    /// * [`TransportError::ProtocolViolation`] for a header that does not
    ///   match the message being reassembled
    /// * [`TransportError::Already`] for a segment of a delivered message
    /// * [`TransportError::Timeout`] for a segment of a discarded message
    /// * [`TransportError::NoResources`] if the Friend Queue is full
    /// * [`TransportError::Busy`] if no context is free
    #[allow(clippy::too_many_arguments)]
    pub fn on_segment<const R: usize>(
        &mut self,
        rx: &NetRx,
        pdu: &[u8],
        rpl: &mut ReplayProtectionList<R>,
        store: &mut impl ReplayStore,
        net: &mut impl NetworkLayer,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) -> Result<RxOutcome, TransportError> {
        if pdu.len() <= SegmentHeader::SIZE {
            error!("[SEG_RX] Too short segmented message (len {})", pdu.len());
            return Err(TransportError::InvalidLength);
        }

        if !rx.local_iface && rpl.check(rx.src, rx.seq, rx.old_iv) == ReplayCheck::Reject {
            warn!(
                "[SEG_RX] Replay: src {:#x} dst {:#x} seq {:#x}",
                rx.src, rx.dst, rx.seq
            );
            return Err(TransportError::Replay);
        }

        let header = SegmentHeader::from_bytes(pdu)?;
        let payload = &pdu[SegmentHeader::SIZE..];
        let seg_n = header.seg_n;
        trace!(
            "[SEG_RX] SeqZero {:#x} SegO {} SegN {}",
            header.seq_zero, header.seg_o, seg_n
        );

        if header.seg_o > seg_n {
            error!("[SEG_RX] SegO greater than SegN ({} > {})", header.seg_o, seg_n);
            return Err(TransportError::InvalidFraming);
        }

        let delta = u32::from((rx.seq as u16).wrapping_sub(header.seq_zero) & SEQ_ZERO_MASK);
        if rx.seq < delta {
            error!("[SEG_RX] Invalid SeqZero {:#x} for seq {:#x}", header.seq_zero, rx.seq);
            return Err(TransportError::InvalidFraming);
        }
        let seq_auth = seq_auth(rx.iv_index, rx.seq - delta);

        self.reset_pending(rx, seq_auth);

        let slot = match self.find(rx, seq_auth) {
            Some(slot) => self.resume(slot, rx, &header, seq_auth, rpl, store, net, now)?,
            None => self.admit(rx, &header, seq_auth, net)?,
        };

        let max_len = self.max_sdu_len();
        let options = self.options;
        let Some(ctx) = self.pool.get_mut(slot) else {
            return Err(TransportError::UnknownContext);
        };

        if ctx.block & (1 << header.seg_o) != 0 {
            debug!("[SEG_RX] Received already received fragment");
            return Ok(RxOutcome::Partial);
        }

        let seg_len = seg_len(ctx.ctl);
        if header.seg_o == seg_n {
            let len = usize::from(seg_n) * seg_len + payload.len();
            if len > max_len {
                error!("[SEG_RX] Too large SDU len {}/{}", len, max_len);
                let target = AckTarget::from_context(ctx);
                target.send(net, seq_auth, 0);
                self.release(slot);
                return Err(TransportError::InvalidLength);
            }
            ctx.len = len;
        } else if payload.len() != seg_len {
            error!("[SEG_RX] Incorrect segment size for message type");
            return Err(TransportError::InvalidLength);
        }

        let offset = usize::from(header.seg_o) * seg_len;
        let Some(dst) = ctx.buf.get_mut(offset..offset + payload.len()) else {
            return Err(TransportError::InvalidLength);
        };
        dst.copy_from_slice(payload);
        ctx.block |= 1 << header.seg_o;
        debug!("[SEG_RX] Seg {}/{} received", header.seg_o, seg_n);

        if !ctx.is_complete() {
            let timeout = incomplete_timeout(&options, ctx.ttl, seg_n, ctx.received_count());
            ctx.incomplete_at = Some(now + timeout);
            if addr::is_unicast(ctx.dst) && ctx.ack_at.is_none() {
                ctx.ack_at = Some(now + ack_timeout(ctx.ttl, ctx.missing_count()));
            }
            return Ok(RxOutcome::Partial);
        }

        debug!("[SEG_RX] Complete SDU from {:#x}", ctx.src);
        ctx.incomplete_at = None;
        ctx.ack_at = None;
        ctx.last_ack = Some(now);
        AckTarget::from_context(ctx).send(net, ctx.seq_auth, ctx.block);

        if !rx.local_iface {
            if let Some(entry) = rpl.commit(rx.src, rx.seq, rx.old_iv) {
                store.store(&entry);
            }
        }

        let sdu = &ctx.buf[..ctx.len];
        if ctx.ctl {
            let opcode = ctl_opcode(ctx.hdr);
            if rx.local_match || opcode == ctl_op::HEARTBEAT {
                upper.recv_control(rx, opcode, sdu);
            }
        } else if rx.local_match {
            upper.recv_access(rx, ctx.seq_auth, ctx.hdr, ctx.szmic, sdu);
        } else {
            trace!("[SEG_RX] Message for LPN {:#x} left to the Friend Queue", rx.dst);
        }

        self.finish(slot);
        Ok(RxOutcome::Complete)
    }

    // A newer SeqAuth from the same pair replaces any unfinished session.
    fn reset_pending(&mut self, rx: &NetRx, seq_auth: u64) {
        let stale: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| {
                ctx.in_use && ctx.src == rx.src && ctx.dst == rx.dst && ctx.seq_auth < seq_auth
            })
            .map(|(slot, _)| slot)
            .collect();
        for slot in stale {
            warn!(
                "[SEG_RX] Discard pending reassembly, src {:#x} dst {:#x}",
                rx.src, rx.dst
            );
            self.release(slot);
        }
    }

    fn find(&self, rx: &NetRx, seq_auth: u64) -> Option<SlotHandle> {
        self.pool
            .find(|ctx| ctx.src == rx.src && ctx.dst == rx.dst && ctx.seq_auth >= seq_auth)
    }

    // Segment for a known session. Returns the slot to merge into, or the
    // reason the segment is not merged.
    #[allow(clippy::too_many_arguments)]
    fn resume<const R: usize>(
        &mut self,
        slot: SlotHandle,
        rx: &NetRx,
        header: &SegmentHeader,
        seq_auth: u64,
        rpl: &mut ReplayProtectionList<R>,
        store: &mut impl ReplayStore,
        net: &mut impl NetworkLayer,
        now: Instant,
    ) -> Result<SlotHandle, TransportError> {
        let Some(ctx) = self.pool.get_mut(slot) else {
            return Err(TransportError::UnknownContext);
        };

        if ctx.seq_auth > seq_auth {
            warn!("[SEG_RX] Ignoring old SeqAuth, src {:#x} dst {:#x}", ctx.src, ctx.dst);
            return Err(TransportError::Replay);
        }

        if ctx.hdr != header.hdr || ctx.seg_n != header.seg_n {
            error!("[SEG_RX] Invalid segment for ongoing session");
            return Err(TransportError::ProtocolViolation);
        }
        if ctx.ctl != rx.ctl {
            error!("[SEG_RX] Inconsistent CTL in segment");
            return Err(TransportError::ProtocolViolation);
        }

        if ctx.in_use {
            trace!("[SEG_RX] Existing RX context, block {:#x}", ctx.block);
            return Ok(slot);
        }

        if !ctx.is_complete() {
            warn!("[SEG_RX] Got segment for discarded SDU");
            return Err(TransportError::Timeout);
        }

        info!("[SEG_RX] Got segment for already complete SDU");
        let due = ctx
            .last_ack
            .is_none_or(|at| now >= at + ack_timeout(ctx.ttl, 0));
        if due {
            ctx.last_ack = Some(now);
            AckTarget::from_rx(rx, ctx.obo).send(net, seq_auth, ctx.block);
        }
        if !rx.local_iface {
            if let Some(entry) = rpl.commit(rx.src, rx.seq, rx.old_iv) {
                store.store(&entry);
            }
        }
        Err(TransportError::Already)
    }

    // First segment of a new session.
    fn admit(
        &mut self,
        rx: &NetRx,
        header: &SegmentHeader,
        seq_auth: u64,
        net: &mut impl NetworkLayer,
    ) -> Result<SlotHandle, TransportError> {
        let segments = header.seg_n + 1;

        if usize::from(segments) * seg_len(rx.ctl) > self.max_sdu_len() {
            error!("[SEG_RX] Too big incoming SDU ({} segments)", segments);
            AckTarget::from_rx(rx, rx.friend_match).send(net, seq_auth, 0);
            return Err(TransportError::InvalidLength);
        }

        if rx.friend_match && !rx.local_match {
            let tx = NetTx::new(rx.net_idx, rx.src, rx.dst, rx.ttl);
            if !net.friend_queue_has_space(&tx, Some(seq_auth), segments) {
                error!("[SEG_RX] No space in Friend Queue for {} segments", segments);
                AckTarget::from_rx(rx, rx.friend_match).send(net, seq_auth, 0);
                return Err(TransportError::NoResources);
            }
        }

        let Some(slot) = self.pool.allocate() else {
            warn!("[SEG_RX] No free slots for new incoming segmented messages");
            return Err(TransportError::Busy);
        };

        let max_len = self.max_sdu_len();
        let Some(ctx) = self.pool.get_mut(slot) else {
            return Err(TransportError::UnknownContext);
        };
        *ctx = RxContext {
            net_idx: rx.net_idx,
            src: rx.src,
            dst: rx.dst,
            seq_auth,
            hdr: header.hdr,
            szmic: header.szmic,
            seg_n: header.seg_n,
            ctl: rx.ctl,
            ttl: rx.ttl,
            obo: rx.friend_match,
            in_use: true,
            ..RxContext::default()
        };
        ctx.buf
            .resize(max_len, 0)
            .map_err(|()| TransportError::InvalidLength)?;

        debug!(
            "[SEG_RX] New RX context, src {:#x} block complete {:#x}",
            rx.src,
            block_complete(header.seg_n)
        );
        Ok(slot)
    }

    /// Earliest armed incomplete or acknowledgment deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pool
            .iter()
            .filter(|(_, ctx)| ctx.in_use)
            .flat_map(|(_, ctx)| [ctx.incomplete_at, ctx.ack_at])
            .flatten()
            .min()
    }

    /// Fire every timer due at `now`.
    ///
    /// An expired incomplete timer discards the message; an expired ack timer
    /// reports the current block and rearms.
    pub fn poll(&mut self, net: &mut impl NetworkLayer, now: Instant) {
        let due: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| {
                ctx.in_use
                    && (ctx.incomplete_at.is_some_and(|at| at <= now)
                        || ctx.ack_at.is_some_and(|at| at <= now))
            })
            .map(|(slot, _)| slot)
            .collect();

        for slot in due {
            let Some(ctx) = self.pool.get_mut(slot) else {
                continue;
            };

            if ctx.incomplete_at.is_some_and(|at| at <= now) {
                warn!(
                    "[SEG_RX] Incomplete timer expired, src {:#x} block {:#x}",
                    ctx.src, ctx.block
                );
                self.finish(slot);
                continue;
            }

            ctx.ack_at = Some(now + ack_timeout(ctx.ttl, ctx.missing_count()));
            ctx.last_ack = Some(now);
            AckTarget::from_context(ctx).send(net, ctx.seq_auth, ctx.block);
        }
    }

    /// Contexts currently reassembling
    pub fn active(&self) -> impl Iterator<Item = &RxContext> {
        self.pool.iter().map(|(_, ctx)| ctx).filter(|ctx| ctx.in_use)
    }

    /// Forget every session, including delivered ones
    pub fn reset(&mut self) {
        for index in 0..N {
            let slot = self.pool.handle_at(index);
            self.release(slot);
        }
    }

    /// Forget every session from `src`
    pub fn reset_single(&mut self, src: u16) {
        let matching: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| ctx.src == src)
            .map(|(slot, _)| slot)
            .collect();
        for slot in matching {
            self.release(slot);
        }
    }

    // Stop reassembling but keep the identity for late segments.
    fn finish(&mut self, slot: SlotHandle) {
        if let Some(ctx) = self.pool.get_mut(slot) {
            ctx.in_use = false;
            ctx.incomplete_at = None;
            ctx.ack_at = None;
        }
        self.pool.invalidate(slot.index());
    }

    fn release(&mut self, slot: SlotHandle) {
        if let Some(ctx) = self.pool.get_mut(slot) {
            *ctx = RxContext::default();
        }
        self.pool.invalidate(slot.index());
    }
}
