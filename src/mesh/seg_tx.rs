//! Segmented message transmission
//!
//! [`SegmentTransmitter`] splits an upper transport PDU into segments, hands
//! each of them to the network layer, and retransmits whatever the receiver
//! has not acknowledged. A context stays allocated while at least one segment
//! is unacknowledged.
//!
//! The network layer reports progress for every segment token: either
//! `on_send_end`, or `on_send_start` with an error when the segment could not
//! be transmitted at all. The retransmission timer is armed once no segment of
//! the message is in flight.

use super::pdu::{SegmentAck, SegmentHeader, block_complete};
use super::{
    MeshOptions, MessageTag, NetRx, NetTx, NetworkLayer, SendToken, TransportError, UpperLayer,
    addr, seq_auth,
};
use crate::constants::{
    APP_SEG_SDU_MAX, CTL_SEG_SDU_MAX, SEG_PDU_MAX, SEG_RETRANSMIT_PER_HOP_MS,
    SEG_RETRANSMIT_UNICAST_MIN_MS, SEQ_ZERO_MASK, TTL_DEFAULT, TX_SEG_MAX, TX_SEG_MSG_COUNT,
};
use crate::pool::{Pool, Reusable, SlotHandle};
use embassy_time::{Duration, Instant};
use heapless::Vec;

/// One segment PDU, header included
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pdu: Vec<u8, SEG_PDU_MAX>,
    busy: bool,
}

impl Segment {
    /// Encoded lower transport PDU
    #[must_use]
    pub fn pdu(&self) -> &[u8] {
        &self.pdu
    }

    /// Whether the network layer still holds this segment
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

/// State of one outbound segmented message
#[derive(Debug, Default)]
pub struct TxContext {
    net: NetTx,
    tag: MessageTag,
    seq_auth: u64,
    seg_n: u8,
    segments: [Option<Segment>; TX_SEG_MAX],
    /// Bitmap of segments not yet acknowledged
    pending: u32,
    in_flight: u8,
    attempts: u8,
    started: bool,
    retransmit_at: Option<Instant>,
}

impl Reusable for TxContext {
    fn is_free(&self) -> bool {
        self.pending == 0
    }
}

impl TxContext {
    /// Destination address
    #[must_use]
    pub fn destination(&self) -> u16 {
        self.net.dst
    }

    /// `SeqAuth` of the message
    #[must_use]
    pub fn seq_auth(&self) -> u64 {
        self.seq_auth
    }

    /// `SeqZero` of the message
    #[must_use]
    pub fn seq_zero(&self) -> u16 {
        self.seq_auth as u16 & SEQ_ZERO_MASK
    }

    /// Number of segments
    #[must_use]
    pub fn segment_count(&self) -> u8 {
        self.seg_n + 1
    }

    /// Number of segments not yet acknowledged
    #[must_use]
    pub fn pending_ack_count(&self) -> u8 {
        self.pending.count_ones() as u8
    }

    /// Retransmission rounds left
    #[must_use]
    pub fn retries_remaining(&self) -> u8 {
        self.attempts
    }

    /// Segment buffer still held for `seg_o`
    #[must_use]
    pub fn segment(&self, seg_o: u8) -> Option<&Segment> {
        self.segments.get(seg_o as usize).and_then(Option::as_ref)
    }

    /// Retransmission deadline, if armed
    #[must_use]
    pub fn retransmit_at(&self) -> Option<Instant> {
        self.retransmit_at
    }
}

/// Pool of outbound segmentation contexts and the retransmission logic
#[derive(Debug)]
pub struct SegmentTransmitter<const N: usize = TX_SEG_MSG_COUNT> {
    pool: Pool<TxContext, N>,
    options: MeshOptions,
}

impl<const N: usize> Default for SegmentTransmitter<N> {
    fn default() -> Self {
        Self::new(MeshOptions::default())
    }
}

impl<const N: usize> SegmentTransmitter<N> {
    /// Create a transmitter with every context free
    #[must_use]
    pub fn new(options: MeshOptions) -> Self {
        Self {
            pool: Pool::new(),
            options,
        }
    }

    /// Retransmission interval for a destination and TTL
    #[must_use]
    pub fn retransmit_timeout(&self, dst: u16, ttl: u8) -> Duration {
        if addr::is_unicast(dst) {
            let ms = self.options.unicast_retransmit_base_ms
                + SEG_RETRANSMIT_PER_HOP_MS * u64::from(ttl);
            Duration::from_millis(ms.max(SEG_RETRANSMIT_UNICAST_MIN_MS))
        } else {
            Duration::from_millis(self.options.group_retransmit_ms)
        }
    }

    /// Segment and transmit `sdu`.
    ///
    /// `hdr` is the first lower transport octet (segmentation bit set).
    /// The caller's [`UpperLayer::send_end`] is invoked exactly once for an
    /// accepted message; a rejected message reports through the returned
    /// error only. A unicast message that went entirely into the Friend Queue
    /// is reported as sent before this returns, and its context is released.
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidLength`] for an empty or oversized SDU
    /// * [`TransportError::Busy`] when a message to the same destination is in
    ///   flight or no context is free
    /// * [`TransportError::NoResources`] when the Friend Queue cannot take a
    ///   unicast message
    /// * any error returned by [`NetworkLayer::send`]
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        net: &mut impl NetworkLayer,
        upper: &mut impl UpperLayer,
        tx: &NetTx,
        hdr: u8,
        ctl: bool,
        sdu: &[u8],
        tag: MessageTag,
    ) -> Result<SlotHandle, TransportError> {
        let seg_len = if ctl { CTL_SEG_SDU_MAX } else { APP_SEG_SDU_MAX };
        if sdu.is_empty() || sdu.len() > seg_len * TX_SEG_MAX {
            warn!("[SEG_TX] Invalid SDU length {}", sdu.len());
            return Err(TransportError::InvalidLength);
        }

        let blocked = self
            .pool
            .iter()
            .any(|(_, ctx)| !ctx.is_free() && ctx.net.src == tx.src && ctx.net.dst == tx.dst);
        if blocked {
            warn!("[SEG_TX] Message to {:#x} already in progress", tx.dst);
            return Err(TransportError::Busy);
        }

        let Some(handle) = self.pool.allocate() else {
            error!("[SEG_TX] No free TX context");
            return Err(TransportError::Busy);
        };

        let seg_n = ((sdu.len() - 1) / seg_len) as u8;
        let seq = net.next_seq();
        let seq_auth = seq_auth(net.iv_index(), seq);
        let mut net_tx = *tx;
        if net_tx.ttl == TTL_DEFAULT {
            net_tx.ttl = net.default_ttl();
        }

        debug!(
            "[SEG_TX] src {:#x} dst {:#x} seq {:#x} seg_n {}",
            net_tx.src, net_tx.dst, seq, seg_n
        );

        if !net.friend_queue_has_space(&net_tx, Some(seq_auth), seg_n + 1) {
            if addr::is_unicast(net_tx.dst) {
                error!("[SEG_TX] Not enough space in Friend Queue");
                self.release(handle);
                return Err(TransportError::NoResources);
            }
            warn!("[SEG_TX] No space in Friend Queue");
        }

        if let Some(ctx) = self.pool.get_mut(handle) {
            *ctx = TxContext {
                net: net_tx,
                tag,
                seq_auth,
                seg_n,
                pending: block_complete(seg_n),
                attempts: self.options.retransmit_attempts,
                ..TxContext::default()
            };
        }

        let header = SegmentHeader {
            hdr,
            szmic: net_tx.aszmic && !ctl,
            seq_zero: seq as u16 & SEQ_ZERO_MASK,
            seg_o: 0,
            seg_n,
        };

        if let Err(err) = self.transmit_segments(net, handle, header, sdu, seg_len) {
            error!("[SEG_TX] Sending segment failed: {:?}", err);
            self.release(handle);
            return Err(err);
        }

        // Everything went to the Friend Queue, nothing is left to track
        let queued_only = self.pool.get(handle).is_some_and(|ctx| ctx.in_flight == 0);
        if queued_only {
            debug!("[SEG_TX] Message to {:#x} handed to the Friend Queue", net_tx.dst);
            self.release(handle);
            upper.send_start(tag, 0, Ok(()));
            upper.send_end(tag, Ok(()));
        }

        Ok(handle)
    }

    fn transmit_segments(
        &mut self,
        net: &mut impl NetworkLayer,
        handle: SlotHandle,
        header: SegmentHeader,
        sdu: &[u8],
        seg_len: usize,
    ) -> Result<(), TransportError> {
        let ctx = self
            .pool
            .get_mut(handle)
            .ok_or(TransportError::UnknownContext)?;

        for (seg_o, chunk) in sdu.chunks(seg_len).enumerate() {
            let seg_o = seg_o as u8;
            let mut pdu: Vec<u8, SEG_PDU_MAX> = Vec::new();
            pdu.extend_from_slice(&SegmentHeader { seg_o, ..header }.to_bytes())
                .and_then(|()| pdu.extend_from_slice(chunk))
                .map_err(|()| TransportError::InvalidLength)?;

            if net.friend_enqueue(&ctx.net, Some(ctx.seq_auth), ctx.seg_n + 1, &pdu)
                && addr::is_unicast(ctx.net.dst)
            {
                // PDUs for a Low Power Node only go out through the Friend Queue
                continue;
            }

            let token = SendToken::Segment { slot: handle, seg_o };
            net.send(&ctx.net, &pdu, token)?;
            ctx.segments[seg_o as usize] = Some(Segment { pdu, busy: true });
            ctx.in_flight += 1;
        }

        Ok(())
    }

    /// The network layer started transmitting a segment.
    ///
    /// The first segment's start is reported to the caller. A failed start
    /// means no `on_send_end` will follow for this segment.
    pub fn on_send_start(
        &mut self,
        slot: SlotHandle,
        seg_o: u8,
        duration: u16,
        result: Result<(), TransportError>,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) {
        let Some(ctx) = self.pool.get_mut(slot) else {
            trace!("[SEG_TX] Start for stale context");
            return;
        };
        if ctx.is_free() {
            return;
        }

        if seg_o == 0 && !ctx.started {
            ctx.started = true;
            upper.send_start(ctx.tag, duration, result);
        }

        if result.is_err() {
            self.segment_sent(slot, seg_o, upper, now);
        }
    }

    /// The network layer finished transmitting a segment.
    pub fn on_send_end(
        &mut self,
        slot: SlotHandle,
        seg_o: u8,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) {
        let active = self.pool.get(slot).is_some_and(|ctx| !ctx.is_free());
        if active {
            self.segment_sent(slot, seg_o, upper, now);
        } else {
            trace!("[SEG_TX] End for stale context");
        }
    }

    fn segment_sent(
        &mut self,
        slot: SlotHandle,
        seg_o: u8,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) {
        let Some(ctx) = self.pool.get_mut(slot) else {
            return;
        };

        if let Some(segment) = ctx.segments.get_mut(seg_o as usize).and_then(Option::as_mut) {
            segment.busy = false;
        }
        ctx.in_flight = ctx.in_flight.saturating_sub(1);
        if ctx.in_flight > 0 {
            return;
        }

        if !addr::is_unicast(ctx.net.dst) && ctx.attempts == 0 {
            debug!("[SEG_TX] Complete TX SDU to group {:#x}", ctx.net.dst);
            self.complete(slot, Ok(()), upper);
            return;
        }

        self.arm_retransmit(slot, now);
    }

    fn arm_retransmit(&mut self, slot: SlotHandle, now: Instant) {
        let timeout = match self.pool.get(slot) {
            Some(ctx) => self.retransmit_timeout(ctx.net.dst, ctx.net.ttl),
            None => return,
        };
        if let Some(ctx) = self.pool.get_mut(slot) {
            ctx.retransmit_at = Some(now + timeout);
        }
    }

    /// Handle a received Segment Acknowledgment payload.
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidLength`] for a malformed payload
    /// * [`TransportError::UnknownContext`] if no message matches
    /// * [`TransportError::ProtocolViolation`] for an ack to a group message
    ///   or one that names segments beyond `SegN`
    pub fn on_ack(
        &mut self,
        rx: &NetRx,
        payload: &[u8],
        net: &mut impl NetworkLayer,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) -> Result<(), TransportError> {
        let ack = SegmentAck::from_bytes(payload).inspect_err(|_| {
            warn!("[SEG_TX] Malformed Segment Ack (len {})", payload.len());
        })?;

        if rx.friend_match {
            debug!("[SEG_TX] Ack for LPN {:#x} of this Friend", rx.dst);
            return Ok(());
        }

        let slot = self
            .lookup(ack.seq_zero, ack.obo, rx.src, rx.net_idx)
            .ok_or_else(|| {
                debug!("[SEG_TX] No matching TX context for ack");
                TransportError::UnknownContext
            })?;

        let (dst, seg_n) = match self.pool.get(slot) {
            Some(ctx) => (ctx.net.dst, ctx.seg_n),
            None => return Err(TransportError::UnknownContext),
        };

        if !addr::is_unicast(dst) {
            warn!("[SEG_TX] Received ack for segments to group");
            return Err(TransportError::ProtocolViolation);
        }

        if ack.block == 0 {
            warn!("[SEG_TX] SDU canceled by {:#x}", rx.src);
            self.complete(slot, Err(TransportError::Canceled), upper);
            return Ok(());
        }

        if ack.block & !block_complete(seg_n) != 0 {
            error!("[SEG_TX] Too large segment number in ack");
            return Err(TransportError::ProtocolViolation);
        }

        let done = match self.pool.get_mut(slot) {
            Some(ctx) => {
                ctx.retransmit_at = None;
                let newly_acked = ctx.pending & ack.block;
                for seg_o in 0..=seg_n {
                    if newly_acked & (1 << seg_o) != 0 {
                        debug!("[SEG_TX] Seg {}/{} acked", seg_o, seg_n);
                        ctx.segments[seg_o as usize] = None;
                    }
                }
                ctx.pending &= !ack.block;
                ctx.pending == 0
            }
            None => return Err(TransportError::UnknownContext),
        };

        if done {
            debug!("[SEG_TX] SDU TX complete");
            self.complete(slot, Ok(()), upper);
        } else {
            self.send_unacked(slot, net, upper, now);
        }

        Ok(())
    }

    fn lookup(&mut self, seq_zero: u16, obo: bool, src: u16, net_idx: u16) -> Option<SlotHandle> {
        let slot = self.pool.find(|ctx| {
            !ctx.is_free()
                && ctx.seq_zero() == seq_zero
                && ctx.net.net_idx == net_idx
                && (ctx.net.dst == src || (obo && ctx.pending == block_complete(ctx.seg_n)))
        })?;

        // A Friend may answer for its Low Power Node, but only before any
        // other ack for this message has been seen.
        if let Some(ctx) = self.pool.get_mut(slot) {
            if ctx.net.dst != src {
                debug!("[SEG_TX] Ack on behalf of {:#x} from {:#x}", ctx.net.dst, src);
                ctx.net.dst = src;
            }
        }
        Some(slot)
    }

    fn send_unacked(
        &mut self,
        slot: SlotHandle,
        net: &mut impl NetworkLayer,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) {
        let Some(ctx) = self.pool.get_mut(slot) else {
            return;
        };

        if ctx.attempts == 0 {
            error!("[SEG_TX] Ran out of retransmit attempts to {:#x}", ctx.net.dst);
            self.complete(slot, Err(TransportError::Timeout), upper);
            return;
        }
        ctx.attempts -= 1;

        let mut failed = false;
        for (seg_o, entry) in ctx.segments.iter_mut().enumerate() {
            let Some(segment) = entry.as_mut() else {
                continue;
            };
            if segment.busy {
                continue;
            }

            let token = SendToken::Segment {
                slot,
                seg_o: seg_o as u8,
            };
            if net.send(&ctx.net, &segment.pdu, token).is_err() {
                failed = true;
                break;
            }
            segment.busy = true;
            ctx.in_flight += 1;
        }

        if failed {
            error!("[SEG_TX] Resending segment failed");
            self.complete(slot, Err(TransportError::SendFailed), upper);
            return;
        }

        let idle = ctx.in_flight == 0;
        if idle {
            self.arm_retransmit(slot, now);
        }
    }

    /// Handle an expired retransmission timer captured as `slot`.
    ///
    /// A handle from a previous occupant of the slot is ignored.
    pub fn on_timeout(
        &mut self,
        slot: SlotHandle,
        net: &mut impl NetworkLayer,
        upper: &mut impl UpperLayer,
        now: Instant,
    ) {
        let Some(ctx) = self.pool.get_mut(slot) else {
            trace!("[SEG_TX] Timer for stale context");
            return;
        };
        match ctx.retransmit_at {
            Some(deadline) if deadline <= now && !ctx.is_free() => {
                ctx.retransmit_at = None;
            }
            _ => return,
        }
        self.send_unacked(slot, net, upper, now);
    }

    /// Earliest armed retransmission deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pool
            .iter()
            .filter(|(_, ctx)| !ctx.is_free())
            .filter_map(|(_, ctx)| ctx.retransmit_at)
            .min()
    }

    /// Fire every retransmission timer due at `now`
    pub fn poll(&mut self, net: &mut impl NetworkLayer, upper: &mut impl UpperLayer, now: Instant) {
        let due: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| !ctx.is_free() && ctx.retransmit_at.is_some_and(|at| at <= now))
            .map(|(slot, _)| slot)
            .collect();

        for slot in due {
            self.on_timeout(slot, net, upper, now);
        }
    }

    /// Whether any segmented message is in flight
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.pool.in_use() > 0
    }

    /// Look up a context by handle
    #[must_use]
    pub fn context(&self, slot: SlotHandle) -> Option<&TxContext> {
        self.pool.get(slot).filter(|ctx| !ctx.is_free())
    }

    /// Abort every message to the unicast address `dst` with `Canceled`
    pub fn reset_single(&mut self, dst: u16, upper: &mut impl UpperLayer) {
        if !addr::is_unicast(dst) {
            return;
        }
        let matching: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| !ctx.is_free() && ctx.net.dst == dst)
            .map(|(slot, _)| slot)
            .collect();
        for slot in matching {
            self.complete(slot, Err(TransportError::Canceled), upper);
        }
    }

    /// Abort every message with `Canceled`
    pub fn reset(&mut self, upper: &mut impl UpperLayer) {
        let active: Vec<SlotHandle, N> = self
            .pool
            .iter()
            .filter(|(_, ctx)| !ctx.is_free())
            .map(|(slot, _)| slot)
            .collect();
        for slot in active {
            self.complete(slot, Err(TransportError::Canceled), upper);
        }
    }

    fn complete(
        &mut self,
        slot: SlotHandle,
        result: Result<(), TransportError>,
        upper: &mut impl UpperLayer,
    ) {
        let Some(tag) = self.pool.get(slot).map(|ctx| ctx.tag) else {
            return;
        };
        self.release(slot);
        upper.send_end(tag, result);
    }

    fn release(&mut self, slot: SlotHandle) {
        if let Some(ctx) = self.pool.get_mut(slot) {
            *ctx = TxContext::default();
        }
        self.pool.invalidate(slot.index());
    }
}
