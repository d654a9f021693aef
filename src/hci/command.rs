//! HCI Command Flow Control
//!
//! The controller grants the host a number of command credits, reported as
//! an absolute count in every Command Complete and Command Status event. The
//! host starts with a single credit and may only send while it holds one.
//!
//! Commands wait in a FIFO queue until a credit is available, then move to
//! the pending list until the controller answers with a matching opcode. A
//! single watchdog covers the oldest pending command; when it fires the
//! command is completed with [`HciError::CommandTimeout`] and is not
//! retried.

use super::{HciError, event_code, opcode};
use crate::constants::{
    COMMAND_QUEUE_SIZE, COMMAND_TIMEOUT_MS, INITIAL_COMMAND_CREDITS, MAX_COMMAND_SIZE,
    MAX_PENDING_COMMANDS, MAX_RETURN_PARAMS,
};
use bt_hci::FromHciBytes;
use bt_hci::cmd::{Cmd, Opcode};
use bt_hci::event::{CommandComplete, CommandStatus};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use heapless::{Deque, Vec};

/// Controller answer to a command
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandResponse {
    /// Command Complete with the status byte split from the return parameters
    Complete {
        /// Status code, `0x00` on success
        status: u8,
        /// Return parameters following the status byte
        return_params: Vec<u8, MAX_RETURN_PARAMS>,
    },
    /// Command Status: the command was started (or rejected)
    Status {
        /// Status code, `0x00` on success
        status: u8,
    },
}

impl CommandResponse {
    /// Status code carried by either response
    #[must_use]
    pub fn status(&self) -> u8 {
        match self {
            CommandResponse::Complete { status, .. } | CommandResponse::Status { status } => {
                *status
            }
        }
    }
}

/// Final outcome of a command
pub type CommandResult = Result<CommandResponse, HciError>;

/// Signal used to hand a command result to an awaiting task, tagged with the
/// opcode it answers
pub type CommandSignal = Signal<CriticalSectionRawMutex, (u16, CommandResult)>;

/// How a command's outcome is delivered
#[derive(Clone, Copy)]
pub enum Completion {
    /// Plain callback, invoked from the receive path
    Callback(fn(CommandResult)),
    /// Signal awaited by an async task
    Signal(&'static CommandSignal),
}

impl Completion {
    fn complete(self, opcode: u16, result: CommandResult) {
        match self {
            Completion::Callback(callback) => callback(result),
            Completion::Signal(signal) => signal.signal((opcode, result)),
        }
    }

    fn uses(&self, signal: &CommandSignal) -> bool {
        matches!(self, Completion::Signal(own) if core::ptr::eq(*own, signal))
    }
}

fn discard(_: CommandResult) {}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Completion::Callback(_) => write!(f, "Callback"),
            Completion::Signal(_) => write!(f, "Signal"),
        }
    }
}

/// Serialised HCI command: opcode, parameter length and parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    data: Vec<u8, MAX_COMMAND_SIZE>,
}

impl CommandPacket {
    /// Build a command from an opcode and raw parameters
    ///
    /// # Errors
    ///
    /// Returns [`HciError::InvalidLength`] for more than 255 parameter bytes.
    pub fn new(opcode: u16, params: &[u8]) -> Result<Self, HciError> {
        let len = u8::try_from(params.len()).map_err(|_| HciError::InvalidLength)?;
        let mut data = Vec::new();
        data.extend_from_slice(&opcode.to_le_bytes())
            .map_err(|()| HciError::InvalidLength)?;
        data.push(len).map_err(|_| HciError::InvalidLength)?;
        data.extend_from_slice(params)
            .map_err(|()| HciError::InvalidLength)?;
        Ok(Self { data })
    }

    /// Serialise a typed `bt-hci` command
    ///
    /// # Errors
    ///
    /// Returns [`HciError::PacketTooLarge`] if the command does not fit, or
    /// [`HciError::InvalidLength`] if its header is malformed.
    pub fn from_cmd<C: Cmd>(cmd: &C) -> Result<Self, HciError> {
        let size = cmd.size();
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let out = buf.get_mut(..size).ok_or(HciError::PacketTooLarge)?;
        cmd.write_hci(&mut *out).map_err(|_| HciError::PacketTooLarge)?;
        let packet = Self {
            data: Vec::from_slice(out).map_err(|()| HciError::PacketTooLarge)?,
        };
        if packet.data.len() < 3 || usize::from(packet.data[2]) != packet.data.len() - 3 {
            return Err(HciError::InvalidLength);
        }
        Ok(packet)
    }

    /// Command opcode
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    /// Wire form without the H4 indicator
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Credits and opcode of a Command Complete that carries no status byte
fn credit_update(params: &[u8]) -> Option<(u8, u16)> {
    let (credits, rest) = u8::from_hci_bytes(params).ok()?;
    let cmd_opcode = Opcode::from_hci_bytes_complete(rest).ok()?;
    Some((credits, cmd_opcode.to_raw()))
}

#[derive(Debug)]
struct QueuedCommand {
    packet: CommandPacket,
    completion: Completion,
}

#[derive(Debug)]
struct PendingCommand {
    opcode: u16,
    sent_at: Instant,
    completion: Completion,
}

/// Outcome of offering an event to the flow controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventDisposition {
    /// Command Complete or Command Status, fully handled
    Consumed,
    /// Any other event, to be passed upward
    Forward,
}

/// Command queue, pending list and credit accounting
#[derive(Debug)]
pub struct CommandFlowController {
    credits: u8,
    timeout: Duration,
    queue: Deque<QueuedCommand, COMMAND_QUEUE_SIZE>,
    pending: Vec<PendingCommand, MAX_PENDING_COMMANDS>,
}

impl Default for CommandFlowController {
    fn default() -> Self {
        Self::new(COMMAND_TIMEOUT_MS)
    }
}

impl CommandFlowController {
    /// Create a controller with the initial single credit
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            credits: INITIAL_COMMAND_CREDITS,
            timeout: Duration::from_millis(timeout_ms),
            queue: Deque::new(),
            pending: Vec::new(),
        }
    }

    /// Queue a command for transmission
    ///
    /// # Errors
    ///
    /// Returns [`HciError::QueueFull`] if the command queue is full.
    pub fn enqueue(
        &mut self,
        packet: CommandPacket,
        completion: Completion,
    ) -> Result<(), HciError> {
        let opcode = packet.opcode();
        self.queue
            .push_back(QueuedCommand { packet, completion })
            .map_err(|_| HciError::QueueFull)?;
        debug!("[HCI] Queued command {:#x}", opcode);
        Ok(())
    }

    /// Whether a command can be sent right now
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.credits > 0 && !self.queue.is_empty() && !self.pending.is_full()
    }

    /// Take the next command to send, spending one credit
    pub fn dequeue(&mut self, now: Instant) -> Option<CommandPacket> {
        if !self.can_send() {
            return None;
        }
        let QueuedCommand { packet, completion } = self.queue.pop_front()?;
        let opcode = packet.opcode();
        // Room was checked by can_send
        let _ = self.pending.push(PendingCommand {
            opcode,
            sent_at: now,
            completion,
        });
        self.credits -= 1;
        debug!(
            "[HCI] Sending command {:#x}, {} credits left",
            opcode,
            self.credits
        );
        Some(packet)
    }

    /// Offer an inbound event.
    ///
    /// Command Complete and Command Status update the credit count and
    /// complete the oldest pending command with the same opcode.
    pub fn on_event(&mut self, code: u8, params: &[u8]) -> EventDisposition {
        match code {
            event_code::COMMAND_COMPLETE => {
                if let Ok(complete) = CommandComplete::from_hci_bytes_complete(params) {
                    self.on_command_complete(&complete);
                } else if let Some((credits, cmd_opcode)) = credit_update(params) {
                    // No return parameters at all, not even a status
                    self.credits = credits;
                    if cmd_opcode == opcode::NOP {
                        debug!("[HCI] Credit update: {}", self.credits);
                    } else {
                        self.resolve(
                            cmd_opcode,
                            CommandResponse::Complete {
                                status: 0,
                                return_params: Vec::new(),
                            },
                        );
                    }
                } else {
                    warn!("[HCI] Malformed Command Complete, {} bytes", params.len());
                }
                EventDisposition::Consumed
            }
            event_code::COMMAND_STATUS => {
                let Ok(status) = CommandStatus::from_hci_bytes_complete(params) else {
                    warn!("[HCI] Malformed Command Status, {} bytes", params.len());
                    return EventDisposition::Consumed;
                };
                self.credits = status.num_hci_cmd_pkts;
                let cmd_opcode = status.cmd_opcode.to_raw();
                if cmd_opcode != opcode::NOP {
                    self.resolve(
                        cmd_opcode,
                        CommandResponse::Status {
                            status: status.status.into_inner(),
                        },
                    );
                }
                EventDisposition::Consumed
            }
            _ => EventDisposition::Forward,
        }
    }

    fn on_command_complete(&mut self, complete: &CommandComplete<'_>) {
        self.credits = complete.num_hci_cmd_pkts;
        let cmd_opcode = complete.cmd_opcode.to_raw();
        if cmd_opcode == opcode::NOP {
            debug!("[HCI] Credit update: {}", self.credits);
            return;
        }

        let Ok(return_params) = Vec::from_slice(&complete.return_param_bytes) else {
            warn!("[HCI] Return parameters of {:#x} too long", cmd_opcode);
            self.fail(cmd_opcode, HciError::PacketTooLarge);
            return;
        };
        self.resolve(
            cmd_opcode,
            CommandResponse::Complete {
                status: complete.status.into_inner(),
                return_params,
            },
        );
    }

    /// Stop delivering to `signal`: whichever command, queued or pending,
    /// still completes through it is left to finish silently.
    ///
    /// The command itself stays in flight so the credit accounting stays in
    /// step with the controller.
    pub fn detach(&mut self, signal: &CommandSignal) {
        let queued = self.queue.iter_mut().map(|cmd| (cmd.packet.opcode(), &mut cmd.completion));
        let pending = self.pending.iter_mut().map(|cmd| (cmd.opcode, &mut cmd.completion));
        for (opcode, completion) in queued.chain(pending) {
            if completion.uses(signal) {
                debug!("[HCI] Command {:#x} abandoned by its caller", opcode);
                *completion = Completion::Callback(discard);
            }
        }
    }

    /// Fire the watchdog if the oldest pending command has expired.
    pub fn poll(&mut self, now: Instant) {
        while let Some(deadline) = self.next_deadline() {
            if now < deadline {
                break;
            }
            let stuck = self.pending.remove(0);
            error!(
                "[HCI] Command {:#x} timed out, controller unresponsive",
                stuck.opcode
            );
            stuck.completion.complete(stuck.opcode, Err(HciError::CommandTimeout));
        }
    }

    /// Watchdog deadline for the oldest pending command
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.first().map(|cmd| cmd.sent_at + self.timeout)
    }

    /// Current credit count
    #[must_use]
    pub fn credits(&self) -> u8 {
        self.credits
    }

    /// Number of queued, not yet sent commands
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of sent commands awaiting a response
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn take_pending(&mut self, opcode: u16) -> Option<PendingCommand> {
        let index = self.pending.iter().position(|cmd| cmd.opcode == opcode)?;
        Some(self.pending.remove(index))
    }

    fn resolve(&mut self, opcode: u16, response: CommandResponse) {
        match self.take_pending(opcode) {
            Some(cmd) => {
                debug!(
                    "[HCI] Command {:#x} answered, status {:#x}",
                    opcode,
                    response.status()
                );
                cmd.completion.complete(opcode, Ok(response));
            }
            None => warn!("[HCI] Response for unknown command {:#x}", opcode),
        }
    }

    fn fail(&mut self, opcode: u16, err: HciError) {
        if let Some(cmd) = self.take_pending(opcode) {
            cmd.completion.complete(opcode, Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_hci::cmd::controller_baseband::Reset;

    static SIGNAL: CommandSignal = Signal::new();

    fn complete_event(credits: u8, opcode: u16, return_params: &[u8]) -> Vec<u8, 16> {
        let mut params = Vec::new();
        params.push(credits).unwrap();
        params.extend_from_slice(&opcode.to_le_bytes()).unwrap();
        params.extend_from_slice(return_params).unwrap();
        params
    }

    fn ms(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    fn noop(_: CommandResult) {}

    #[test]
    fn test_command_packet() {
        let packet = CommandPacket::new(0x0C03, &[]).unwrap();
        assert_eq!(packet.as_bytes(), &[0x03, 0x0C, 0x00]);
        assert_eq!(packet.opcode(), 0x0C03);

        let typed = CommandPacket::from_cmd(&Reset::new()).unwrap();
        assert_eq!(typed, packet);

        assert_eq!(
            CommandPacket::new(0x0C03, &[0u8; 256]),
            Err(HciError::InvalidLength)
        );
    }

    #[test]
    fn test_single_initial_credit() {
        let mut flow = CommandFlowController::default();
        let completion = Completion::Callback(noop);
        flow.enqueue(CommandPacket::new(0x0C03, &[]).unwrap(), completion)
            .unwrap();
        flow.enqueue(CommandPacket::new(0x1001, &[]).unwrap(), completion)
            .unwrap();

        assert_eq!(flow.dequeue(ms(0)).map(|cmd| cmd.opcode()), Some(0x0C03));
        // No credits until the controller answers
        assert!(flow.dequeue(ms(0)).is_none());
        assert_eq!(flow.credits(), 0);

        let params = complete_event(1, 0x0C03, &[0x00]);
        assert_eq!(
            flow.on_event(event_code::COMMAND_COMPLETE, &params),
            EventDisposition::Consumed
        );
        assert_eq!(flow.pending(), 0);
        assert_eq!(flow.dequeue(ms(1)).map(|cmd| cmd.opcode()), Some(0x1001));
    }

    #[test]
    fn test_credits_are_absolute() {
        let mut flow = CommandFlowController::default();
        let completion = Completion::Callback(noop);
        for opcode in [0x0C03, 0x1001, 0x1002, 0x1003] {
            flow.enqueue(CommandPacket::new(opcode, &[]).unwrap(), completion)
                .unwrap();
        }
        flow.dequeue(ms(0)).unwrap();

        // Controller grants 2 while answering the first command
        flow.on_event(
            event_code::COMMAND_COMPLETE,
            &complete_event(2, 0x0C03, &[0x00]),
        );
        assert_eq!(flow.credits(), 2);
        assert_eq!(flow.dequeue(ms(1)).map(|cmd| cmd.opcode()), Some(0x1001));
        assert_eq!(flow.dequeue(ms(1)).map(|cmd| cmd.opcode()), Some(0x1002));
        assert!(flow.dequeue(ms(1)).is_none());
        assert_eq!(flow.queued(), 1);

        // Unsolicited NOP only updates credits
        flow.on_event(event_code::COMMAND_COMPLETE, &complete_event(1, 0x0000, &[]));
        assert_eq!(flow.credits(), 1);
        assert_eq!(flow.pending(), 2);
        assert_eq!(flow.dequeue(ms(2)).map(|cmd| cmd.opcode()), Some(0x1003));
    }

    #[test]
    fn test_status_with_zero_credits_holds_queue() {
        let mut flow = CommandFlowController::default();
        let completion = Completion::Callback(noop);
        flow.enqueue(CommandPacket::new(0x0401, &[0x00]).unwrap(), completion)
            .unwrap();
        flow.enqueue(CommandPacket::new(0x0C03, &[]).unwrap(), completion)
            .unwrap();
        flow.dequeue(ms(0)).unwrap();

        // Status pending, 0 credits, Inquiry
        flow.on_event(event_code::COMMAND_STATUS, &[0x00, 0x00, 0x01, 0x04]);
        assert_eq!(flow.credits(), 0);
        assert!(!flow.can_send());
        assert!(flow.dequeue(ms(1)).is_none());

        flow.on_event(event_code::COMMAND_COMPLETE, &complete_event(1, 0x0000, &[]));
        assert_eq!(flow.dequeue(ms(2)).map(|cmd| cmd.opcode()), Some(0x0C03));
    }

    #[test]
    fn test_completion_through_signal() {
        let mut flow = CommandFlowController::default();
        flow.enqueue(
            CommandPacket::new(0x0401, &[0x33, 0x8B, 0x9E, 0x08, 0x00]).unwrap(),
            Completion::Signal(&SIGNAL),
        )
        .unwrap();
        flow.dequeue(ms(0)).unwrap();

        // Command Status: status, credits, opcode
        flow.on_event(event_code::COMMAND_STATUS, &[0x00, 0x01, 0x01, 0x04]);
        assert_eq!(
            SIGNAL.try_take(),
            Some((0x0401, Ok(CommandResponse::Status { status: 0x00 })))
        );
        assert_eq!(flow.credits(), 1);
    }

    #[test]
    fn test_complete_splits_status() {
        static COMPLETE: CommandSignal = Signal::new();
        let mut flow = CommandFlowController::default();
        flow.enqueue(
            CommandPacket::new(0x1005, &[]).unwrap(),
            Completion::Signal(&COMPLETE),
        )
        .unwrap();
        flow.dequeue(ms(0)).unwrap();

        flow.on_event(
            event_code::COMMAND_COMPLETE,
            &complete_event(1, 0x1005, &[0x00, 0xFD, 0x03, 0x40]),
        );
        match COMPLETE.try_take() {
            Some((
                0x1005,
                Ok(CommandResponse::Complete {
                    status,
                    return_params,
                }),
            )) => {
                assert_eq!(status, 0x00);
                assert_eq!(return_params.as_slice(), &[0xFD, 0x03, 0x40]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_detached_signal_is_not_completed() {
        static ABANDONED: CommandSignal = Signal::new();
        let mut flow = CommandFlowController::default();
        flow.enqueue(
            CommandPacket::new(0x0C03, &[]).unwrap(),
            Completion::Signal(&ABANDONED),
        )
        .unwrap();
        flow.enqueue(
            CommandPacket::new(0x1001, &[]).unwrap(),
            Completion::Signal(&ABANDONED),
        )
        .unwrap();
        flow.dequeue(ms(0)).unwrap();

        // One pending, one still queued
        flow.detach(&ABANDONED);
        flow.on_event(
            event_code::COMMAND_COMPLETE,
            &complete_event(1, 0x0C03, &[0x00]),
        );
        assert!(ABANDONED.try_take().is_none());
        assert_eq!(flow.pending(), 0);
        assert_eq!(flow.credits(), 1);

        flow.dequeue(ms(1)).unwrap();
        flow.poll(ms(COMMAND_TIMEOUT_MS + 1));
        assert!(ABANDONED.try_take().is_none());
        assert_eq!(flow.pending(), 0);
    }

    #[test]
    fn test_complete_without_status() {
        static BARE: CommandSignal = Signal::new();
        let mut flow = CommandFlowController::default();
        flow.enqueue(
            CommandPacket::new(0x0C03, &[]).unwrap(),
            Completion::Signal(&BARE),
        )
        .unwrap();
        flow.dequeue(ms(0)).unwrap();

        flow.on_event(event_code::COMMAND_COMPLETE, &complete_event(2, 0x0C03, &[]));
        assert_eq!(flow.credits(), 2);
        assert_eq!(
            BARE.try_take(),
            Some((
                0x0C03,
                Ok(CommandResponse::Complete {
                    status: 0x00,
                    return_params: Vec::new(),
                })
            ))
        );
    }

    #[test]
    fn test_unknown_opcode_and_other_events() {
        let mut flow = CommandFlowController::default();
        assert_eq!(
            flow.on_event(event_code::COMMAND_COMPLETE, &complete_event(3, 0x1009, &[0])),
            EventDisposition::Consumed
        );
        assert_eq!(flow.credits(), 3);
        assert_eq!(
            flow.on_event(event_code::NUMBER_OF_COMPLETED_PACKETS, &[0x00]),
            EventDisposition::Forward
        );
        // Truncated events are dropped without touching credits
        assert_eq!(
            flow.on_event(event_code::COMMAND_STATUS, &[0x00]),
            EventDisposition::Consumed
        );
        assert_eq!(flow.credits(), 3);
    }

    #[test]
    fn test_watchdog_timeout() {
        static TIMEOUT: CommandSignal = Signal::new();
        let mut flow = CommandFlowController::new(8_000);
        flow.enqueue(
            CommandPacket::new(0x0C03, &[]).unwrap(),
            Completion::Signal(&TIMEOUT),
        )
        .unwrap();
        flow.enqueue(
            CommandPacket::new(0x1001, &[]).unwrap(),
            Completion::Callback(noop),
        )
        .unwrap();

        assert!(flow.next_deadline().is_none());
        flow.dequeue(ms(100)).unwrap();
        assert_eq!(flow.next_deadline(), Some(ms(8_100)));

        flow.poll(ms(8_099));
        assert_eq!(flow.pending(), 1);

        flow.poll(ms(8_100));
        assert_eq!(flow.pending(), 0);
        assert_eq!(
            TIMEOUT.try_take(),
            Some((0x0C03, Err(HciError::CommandTimeout)))
        );

        // Not retried, and the spent credit is not given back
        assert_eq!(flow.credits(), 0);
        assert!(flow.dequeue(ms(8_100)).is_none());
        assert_eq!(flow.queued(), 1);
    }

    #[test]
    fn test_pending_list_bound() {
        let mut flow = CommandFlowController::default();
        let completion = Completion::Callback(noop);
        for opcode in 0..=MAX_PENDING_COMMANDS as u16 {
            flow.enqueue(CommandPacket::new(0x1000 + opcode, &[]).unwrap(), completion)
                .unwrap();
        }
        flow.on_event(event_code::COMMAND_COMPLETE, &complete_event(10, 0x0000, &[]));

        for _ in 0..MAX_PENDING_COMMANDS {
            assert!(flow.dequeue(ms(0)).is_some());
        }
        assert!(!flow.can_send());
        assert!(flow.dequeue(ms(0)).is_none());
        assert_eq!(flow.credits(), 10 - MAX_PENDING_COMMANDS as u8);
    }

    #[test]
    fn test_queue_full() {
        let mut flow = CommandFlowController::default();
        let completion = Completion::Callback(noop);
        for _ in 0..COMMAND_QUEUE_SIZE {
            flow.enqueue(CommandPacket::new(0x0C03, &[]).unwrap(), completion)
                .unwrap();
        }
        assert_eq!(
            flow.enqueue(CommandPacket::new(0x0C03, &[]).unwrap(), completion),
            Err(HciError::QueueFull)
        );
    }
}
