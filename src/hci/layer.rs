//! HCI layer
//!
//! Joins the command flow controller, the ACL fragmenter and the reassembler
//! behind a single owner so the transmit and receive tasks share one view of
//! credits and buffer sizes.
//!
//! Outbound, the command queue is always served before the packet queue.
//! Inbound, Command Complete and Command Status events are consumed here and
//! everything else is passed upward, with ACL data reassembled first.

use super::command::{
    CommandFlowController, CommandPacket, CommandSignal, Completion, EventDisposition,
};
use super::fragmenter::{AclFragmenter, AclReassembler, Fragment};
use super::{HciError, HciPacket, PacketKind, event_code, event_parts, opcode};
use crate::HciOptions;
use crate::constants::PACKET_QUEUE_SIZE;
use bt_hci::FromHciBytes;
use bt_hci::event::CommandComplete;
use bt_hci::param::Status;
use embassy_time::Instant;
use heapless::Deque;

/// Host side of the HCI transport
#[derive(Debug)]
pub struct HciLayer {
    commands: CommandFlowController,
    packets: Deque<HciPacket, PACKET_QUEUE_SIZE>,
    fragmenter: AclFragmenter,
    reassembler: AclReassembler,
}

impl Default for HciLayer {
    fn default() -> Self {
        Self::new(&HciOptions::default())
    }
}

impl HciLayer {
    /// Create a layer configured by `options`
    #[must_use]
    pub fn new(options: &HciOptions) -> Self {
        Self {
            commands: CommandFlowController::new(options.command_timeout_ms),
            packets: Deque::new(),
            fragmenter: AclFragmenter::new(
                options.acl_data_size_classic,
                options.acl_data_size_le,
            ),
            reassembler: AclReassembler::new(),
        }
    }

    /// Queue a command
    ///
    /// # Errors
    ///
    /// Returns [`HciError::QueueFull`] if the command queue is full.
    pub fn send_command(
        &mut self,
        command: CommandPacket,
        completion: Completion,
    ) -> Result<(), HciError> {
        self.commands.enqueue(command, completion)
    }

    /// Queue a data packet
    ///
    /// # Errors
    ///
    /// * [`HciError::InvalidPacketType`] for command and event packets
    /// * [`HciError::QueueFull`] if the packet queue is full
    pub fn send_packet(&mut self, packet: HciPacket) -> Result<(), HciError> {
        if matches!(packet.kind(), PacketKind::Cmd | PacketKind::Event) {
            return Err(HciError::InvalidPacketType);
        }
        self.packets
            .push_back(packet)
            .map_err(|_| HciError::QueueFull)
    }

    /// Update the controller's ACL buffer sizes
    pub fn set_acl_data_sizes(&mut self, classic: u16, le: u16) {
        self.fragmenter.set_acl_data_sizes(classic, le);
    }

    /// Next packet to write to the controller.
    ///
    /// A command is returned whenever a credit allows it; otherwise the next
    /// ACL fragment, or the next queued data packet. The remainder of a packet
    /// whose segment budget ran out goes to the back of the packet queue.
    pub fn next_outbound(&mut self, now: Instant) -> Option<HciPacket> {
        if let Some(command) = self.commands.dequeue(now) {
            return HciPacket::new(PacketKind::Cmd, command.as_bytes()).ok();
        }

        loop {
            if self.fragmenter.is_busy() {
                match self.fragmenter.next_fragment() {
                    Some(Fragment::Send(fragment)) => return Some(fragment),
                    Some(Fragment::Requeue(rest)) => {
                        if self.packets.push_back(rest).is_err() {
                            warn!("[HCI] Packet queue full, dropping ACL remainder");
                        }
                    }
                    None => {}
                }
                continue;
            }

            let packet = self.packets.pop_front()?;
            if packet.kind() != PacketKind::AclData {
                return Some(packet);
            }
            if let Err(err) = self.fragmenter.start(packet) {
                warn!("[HCI] Cannot fragment ACL packet: {:?}", err);
            }
        }
    }

    /// Whether anything is ready to be written
    #[must_use]
    pub fn has_outbound(&self) -> bool {
        self.commands.can_send() || self.fragmenter.is_busy() || !self.packets.is_empty()
    }

    /// Process a packet from the controller, returning what must go upward.
    pub fn on_inbound(&mut self, packet: HciPacket) -> Option<HciPacket> {
        match packet.kind() {
            PacketKind::Event => {
                let Some((code, params)) = event_parts(packet.as_bytes()) else {
                    warn!("[HCI] Truncated event, dropping");
                    return None;
                };
                if code == event_code::COMMAND_COMPLETE {
                    self.track_buffer_sizes(params);
                }
                match self.commands.on_event(code, params) {
                    EventDisposition::Consumed => None,
                    EventDisposition::Forward => Some(packet),
                }
            }
            PacketKind::AclData => self.reassembler.reassemble(packet),
            PacketKind::SyncData | PacketKind::IsoData => Some(packet),
            PacketKind::Cmd => {
                warn!("[HCI] Command packet from controller, dropping");
                None
            }
        }
    }

    /// Stop delivering command results to `signal`
    pub fn detach_command(&mut self, signal: &CommandSignal) {
        self.commands.detach(signal);
    }

    /// Fire the command watchdog if due
    pub fn poll(&mut self, now: Instant) {
        self.commands.poll(now);
    }

    /// Deadline of the command watchdog
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.commands.next_deadline()
    }

    /// Command flow controller state
    #[must_use]
    pub fn commands(&self) -> &CommandFlowController {
        &self.commands
    }

    fn track_buffer_sizes(&mut self, params: &[u8]) {
        let Ok(complete) = CommandComplete::from_hci_bytes_complete(params) else {
            return;
        };
        if complete.status != Status::SUCCESS {
            return;
        }
        let [lo, hi, ..] = *complete.return_param_bytes else {
            return;
        };
        let size = u16::from_le_bytes([lo, hi]);
        let (classic, le) = self.fragmenter.acl_data_sizes();
        match complete.cmd_opcode.to_raw() {
            opcode::READ_BUFFER_SIZE => self.fragmenter.set_acl_data_sizes(size, le),
            opcode::LE_READ_BUFFER_SIZE => self.fragmenter.set_acl_data_sizes(classic, size),
            _ => {}
        }
    }
}
