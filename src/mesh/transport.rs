//! Lower transport entry points
//!
//! [`MeshTransport`] owns both segment stores and the Replay Protection List
//! and routes traffic between them:
//!
//! * outbound SDUs either leave as a single unsegmented PDU or go through the
//!   [`SegmentTransmitter`]
//! * inbound segmented PDUs go to the [`SegmentReassembler`], unsegmented ones
//!   are replay-checked and dispatched directly
//! * Segment Acknowledgments are routed to the transmitter
//!
//! # Example
//!
//! ```rust,no_run
//! use meshbird::mesh::transport::MeshTransport;
//! use meshbird::mesh::{MessageTag, NetTx, NetworkLayer, UpperLayer};
//!
//! fn send_status<N: NetworkLayer, U: UpperLayer>(transport: &mut MeshTransport<N, U>) {
//!     let tx = NetTx::new(0, 0x0001, 0x0002, 5).with_app_key(0x12);
//!     let sdu = [0x82, 0x04, 0x01, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
//!     if let Err(err) = transport.send(&tx, &sdu, MessageTag(1)) {
//!         // Busy: retry once the previous message to 0x0002 completes
//!         let _ = err;
//!     }
//! }
//! ```

use super::pdu::{ctl_hdr, ctl_op, ctl_opcode, is_segmented, seg_hdr, unseg_hdr};
use super::replay::{ReplayProtectionList, ReplayStore};
use super::seg_rx::SegmentReassembler;
use super::seg_tx::SegmentTransmitter;
use super::{
    MeshOptions, MessageTag, NetRx, NetTx, NetworkLayer, SendToken, TransportError, UpperLayer,
    addr, seq_auth,
};
use crate::constants::{APP_UNSEG_SDU_MAX, CTL_UNSEG_SDU_MAX, TTL_DEFAULT, UNSEG_PDU_MAX};
use embassy_time::Instant;
use heapless::Vec;

/// The Mesh lower transport layer
#[derive(Debug)]
pub struct MeshTransport<N: NetworkLayer, U: UpperLayer, S: ReplayStore = ()> {
    net: N,
    upper: U,
    store: S,
    tx: SegmentTransmitter,
    rx: SegmentReassembler,
    rpl: ReplayProtectionList,
    iv_update_pending: bool,
}

impl<N: NetworkLayer, U: UpperLayer> MeshTransport<N, U> {
    /// Create a transport without Replay Protection List persistence
    #[must_use]
    pub fn new(net: N, upper: U) -> Self {
        Self::with_store(net, upper, (), MeshOptions::default())
    }
}

impl<N: NetworkLayer, U: UpperLayer, S: ReplayStore> MeshTransport<N, U, S> {
    /// Create a transport that reports Replay Protection List changes to `store`
    #[must_use]
    pub fn with_store(net: N, upper: U, store: S, options: MeshOptions) -> Self {
        Self {
            net,
            upper,
            store,
            tx: SegmentTransmitter::new(options),
            rx: SegmentReassembler::new(options),
            rpl: ReplayProtectionList::new(),
            iv_update_pending: false,
        }
    }

    /// Send an access PDU (already encrypted by the upper transport layer).
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidLength`] for an empty or oversized SDU
    /// * any error of [`SegmentTransmitter::send`] or [`NetworkLayer::send`]
    pub fn send(
        &mut self,
        tx: &NetTx,
        sdu: &[u8],
        tag: MessageTag,
    ) -> Result<(), TransportError> {
        if sdu.is_empty() {
            return Err(TransportError::InvalidLength);
        }

        if sdu.len() > APP_UNSEG_SDU_MAX || tx.force_segmented {
            let hdr = seg_hdr(tx.akf, tx.aid);
            return self
                .tx
                .send(&mut self.net, &mut self.upper, tx, hdr, false, sdu, tag)
                .map(|_| ());
        }

        debug!("[TRANSPORT] Unsegmented access to {:#x} len {}", tx.dst, sdu.len());
        self.send_unsegmented(tx, unseg_hdr(tx.akf, tx.aid), sdu, tag)
    }

    /// Send a transport control message.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_ctl(
        &mut self,
        tx: &NetTx,
        opcode: u8,
        payload: &[u8],
        tag: MessageTag,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::InvalidLength);
        }

        if payload.len() > CTL_UNSEG_SDU_MAX || tx.force_segmented {
            let hdr = ctl_hdr(opcode, true);
            return self
                .tx
                .send(&mut self.net, &mut self.upper, tx, hdr, true, payload, tag)
                .map(|_| ());
        }

        debug!("[TRANSPORT] Control {:#x} to {:#x}", opcode, tx.dst);
        self.send_unsegmented(tx, ctl_hdr(opcode, false), payload, tag)
    }

    fn send_unsegmented(
        &mut self,
        tx: &NetTx,
        hdr: u8,
        sdu: &[u8],
        tag: MessageTag,
    ) -> Result<(), TransportError> {
        let mut pdu: Vec<u8, UNSEG_PDU_MAX> = Vec::new();
        pdu.push(hdr)
            .map_err(|_| TransportError::InvalidLength)?;
        pdu.extend_from_slice(sdu)
            .map_err(|()| TransportError::InvalidLength)?;

        let mut net_tx = *tx;
        if net_tx.ttl == TTL_DEFAULT {
            net_tx.ttl = self.net.default_ttl();
        }

        if self.net.friend_enqueue(&net_tx, None, 1, &pdu) && addr::is_unicast(net_tx.dst) {
            self.upper.send_start(tag, 0, Ok(()));
            self.upper.send_end(tag, Ok(()));
            return Ok(());
        }

        self.net.send(&net_tx, &pdu, SendToken::Single(tag))
    }

    /// Process a decrypted lower transport PDU.
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidLength`] for an empty or truncated PDU
    /// * [`TransportError::Replay`] for a replayed unsegmented PDU
    /// * any error of [`SegmentReassembler::on_segment`] or
    ///   [`SegmentTransmitter::on_ack`]
    pub fn recv(&mut self, rx: &NetRx, pdu: &[u8], now: Instant) -> Result<(), TransportError> {
        let Some(&hdr) = pdu.first() else {
            return Err(TransportError::InvalidLength);
        };

        if is_segmented(hdr) {
            if !rx.local_match && !rx.friend_match {
                trace!("[TRANSPORT] Segment for {:#x} is not ours, ignoring", rx.dst);
                return Ok(());
            }
            let outcome = self.rx.on_segment(
                rx,
                pdu,
                &mut self.rpl,
                &mut self.store,
                &mut self.net,
                &mut self.upper,
                now,
            )?;
            trace!("[TRANSPORT] Segment from {:#x}: {:?}", rx.src, outcome);
            return Ok(());
        }

        if pdu.len() < 2 {
            warn!("[TRANSPORT] Too short unsegmented PDU");
            return Err(TransportError::InvalidLength);
        }

        if !rx.local_iface {
            let Some(entry) = self.rpl.check_and_commit(rx.src, rx.seq, rx.old_iv) else {
                warn!(
                    "[TRANSPORT] Replay: src {:#x} dst {:#x} seq {:#x}",
                    rx.src, rx.dst, rx.seq
                );
                return Err(TransportError::Replay);
            };
            self.store.store(&entry);
        }

        let payload = &pdu[1..];
        if !rx.ctl {
            if !rx.local_match {
                trace!("[TRANSPORT] Access PDU for {:#x} is not ours, ignoring", rx.dst);
                return Ok(());
            }
            let seq_auth = seq_auth(rx.iv_index, rx.seq);
            self.upper.recv_access(rx, seq_auth, hdr, false, payload);
            return Ok(());
        }

        let opcode = ctl_opcode(hdr);
        if opcode == ctl_op::ACK {
            let result = self
                .tx
                .on_ack(rx, payload, &mut self.net, &mut self.upper, now);
            self.resume_iv_update_if_idle();
            return result;
        }

        // Only acks and heartbeats are processed without a local match
        if opcode != ctl_op::HEARTBEAT && !rx.local_match {
            trace!("[TRANSPORT] Control {:#x} for {:#x} is not ours", opcode, rx.dst);
            return Ok(());
        }
        self.upper.recv_control(rx, opcode, payload);
        Ok(())
    }

    /// The network layer started transmitting the PDU identified by `token`.
    ///
    /// A failed start of an unsegmented message also ends it.
    pub fn on_send_start(
        &mut self,
        token: SendToken,
        duration: u16,
        result: Result<(), TransportError>,
        now: Instant,
    ) {
        match token {
            SendToken::None => {}
            SendToken::Single(tag) => {
                self.upper.send_start(tag, duration, result);
                if result.is_err() {
                    self.upper.send_end(tag, result);
                }
            }
            SendToken::Segment { slot, seg_o } => {
                self.tx
                    .on_send_start(slot, seg_o, duration, result, &mut self.upper, now);
                self.resume_iv_update_if_idle();
            }
        }
    }

    /// The network layer finished transmitting the PDU identified by `token`.
    pub fn on_send_end(&mut self, token: SendToken, now: Instant) {
        match token {
            SendToken::None => {}
            SendToken::Single(tag) => self.upper.send_end(tag, Ok(())),
            SendToken::Segment { slot, seg_o } => {
                self.tx.on_send_end(slot, seg_o, &mut self.upper, now);
                self.resume_iv_update_if_idle();
            }
        }
    }

    /// Fire every timer due at `now`
    pub fn poll(&mut self, now: Instant) {
        self.tx.poll(&mut self.net, &mut self.upper, now);
        self.rx.poll(&mut self.net, now);
        self.resume_iv_update_if_idle();
    }

    /// Earliest deadline of either segment store
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.tx.next_deadline(), self.rx.next_deadline()) {
            (Some(tx), Some(rx)) => Some(tx.min(rx)),
            (tx, rx) => tx.or(rx),
        }
    }

    /// Whether any segmented message is being transmitted
    #[must_use]
    pub fn tx_in_progress(&self) -> bool {
        self.tx.in_progress()
    }

    /// Request an IV update once segmented transmission is idle.
    ///
    /// [`NetworkLayer::resume_iv_update`] is called immediately when nothing
    /// is in flight, otherwise when the last TX context is released.
    pub fn defer_iv_update(&mut self) {
        debug!("[TRANSPORT] IV update deferred");
        self.iv_update_pending = true;
        self.resume_iv_update_if_idle();
    }

    /// Whether an IV update is waiting for segmented TX to finish
    #[must_use]
    pub fn iv_update_pending(&self) -> bool {
        self.iv_update_pending
    }

    fn resume_iv_update_if_idle(&mut self) {
        if self.iv_update_pending && !self.tx.in_progress() {
            info!("[TRANSPORT] Resuming deferred IV update");
            self.iv_update_pending = false;
            self.net.resume_iv_update();
        }
    }

    /// Roll the Replay Protection List over to a new IV index
    pub fn iv_update(&mut self) -> usize {
        self.rpl.iv_update(&mut self.store)
    }

    /// Drop every reassembly context
    pub fn rx_reset(&mut self) {
        self.rx.reset();
    }

    /// Cancel every segmented transmission
    pub fn tx_reset(&mut self) {
        self.tx.reset(&mut self.upper);
        self.resume_iv_update_if_idle();
    }

    /// Forget a removed node: its reassembly contexts and replay entry
    pub fn rx_reset_single(&mut self, src: u16) {
        if !addr::is_unicast(src) {
            return;
        }
        self.rx.reset_single(src);
        self.rpl.remove(src, &mut self.store);
    }

    /// Cancel segmented transmissions to a removed node
    pub fn tx_reset_single(&mut self, dst: u16) {
        self.tx.reset_single(dst, &mut self.upper);
        self.resume_iv_update_if_idle();
    }

    /// Forget every Replay Protection List entry
    pub fn rpl_clear(&mut self) {
        self.rpl.clear(&mut self.store);
    }

    /// Replay Protection List
    #[must_use]
    pub fn rpl(&self) -> &ReplayProtectionList {
        &self.rpl
    }

    /// Network layer
    pub fn network(&self) -> &N {
        &self.net
    }

    /// Network layer, mutably
    pub fn network_mut(&mut self) -> &mut N {
        &mut self.net
    }

    /// Upper layer
    pub fn upper(&self) -> &U {
        &self.upper
    }

    /// Upper layer, mutably
    pub fn upper_mut(&mut self) -> &mut U {
        &mut self.upper
    }

    /// Replay Protection List persistence hook
    pub fn store(&self) -> &S {
        &self.store
    }
}
