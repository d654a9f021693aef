//! `MeshBird` API Functions
//!
//! Public API for interacting with the processor tasks. These functions use
//! static channels and signals to communicate with the tasks and are meant
//! to be called from application code.
//!
//! # Usage
//!
//! ```rust,no_run
//! use meshbird::api::{next_upward_packet, send_command};
//! use bt_hci::cmd::controller_baseband::Reset;
//!
//! # async fn example() -> Result<(), meshbird::Error> {
//! // Reset the controller and wait for its Command Complete
//! let response = send_command(&Reset::new()).await?;
//! assert_eq!(response.status(), 0x00);
//!
//! // Events other than command responses arrive here
//! let event = next_upward_packet().await;
//! # let _ = event;
//! # Ok(())
//! # }
//! ```

use crate::constants::TRANSPORT_PDU_MAX;
use crate::hci::command::{CommandPacket, CommandResponse, Completion};
use crate::hci::HciPacket;
use crate::mesh::{MessageTag, NetRx, NetTx, SendToken, TransportError};
use crate::{
    COMMAND_LOCK, COMMAND_SIGNAL, Error, HCI_LAYER, HCI_TX_SIGNAL, MESH_CHANNEL, MeshRequest,
    UPWARD_CHANNEL, hci_layer,
};
use bt_hci::cmd::Cmd;
use heapless::Vec;

/// Send a typed HCI command and wait for its Command Complete or Command
/// Status.
///
/// Concurrent callers are served one at a time.
///
/// # Errors
///
/// Returns an error if the `HciLayer` is not initialized, the command queue
/// is full, or the controller does not answer before the command timeout.
pub async fn send_command<C: Cmd>(cmd: &C) -> Result<CommandResponse, Error> {
    let packet = CommandPacket::from_cmd(cmd)?;
    send_command_packet(packet).await
}

/// Send a pre-serialised command and wait for its response.
///
/// Dropping the returned future before it resolves leaves the command in
/// flight, but its response is no longer delivered to anyone.
///
/// # Errors
///
/// Same as [`send_command`].
pub async fn send_command_packet(packet: CommandPacket) -> Result<CommandResponse, Error> {
    let _lock = COMMAND_LOCK.lock().await;
    let opcode = packet.opcode();
    COMMAND_SIGNAL.reset();
    let mut waiting = {
        let mut layer = hci_layer().await.map_err(|_| Error::NotInitialized)?;
        layer.send_command(packet, Completion::Signal(&COMMAND_SIGNAL))?;
        WaitingCommand { armed: true }
    };
    HCI_TX_SIGNAL.signal(());

    loop {
        let (answered, result) = COMMAND_SIGNAL.wait().await;
        if answered == opcode {
            waiting.armed = false;
            return Ok(result?);
        }
        warn!("[API] Dropping response for {:#x} while waiting for {:#x}", answered, opcode);
    }
}

/// Detaches the shared command signal if its waiter goes away early
struct WaitingCommand {
    armed: bool,
}

impl Drop for WaitingCommand {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Layer guards are never held across an await, so this only fails
        // when another core is inside the layer right now
        match HCI_LAYER.try_lock() {
            Ok(mut layer) => {
                if let Some(layer) = layer.as_mut() {
                    layer.detach_command(&COMMAND_SIGNAL);
                }
            }
            Err(_) => warn!("[API] Layer busy, abandoned command keeps its signal"),
        }
    }
}

/// Queue an outbound ACL, SCO or ISO packet.
///
/// ACL packets are fragmented to the controller's buffer size on the way out.
///
/// # Errors
///
/// Returns an error if the `HciLayer` is not initialized, the packet queue is
/// full, or the packet is a command or event.
pub async fn send_acl(packet: HciPacket) -> Result<(), Error> {
    {
        let mut layer = hci_layer().await.map_err(|_| Error::NotInitialized)?;
        layer.send_packet(packet)?;
    }
    HCI_TX_SIGNAL.signal(());
    Ok(())
}

/// Update the controller's ACL buffer sizes used for fragmentation.
///
/// # Errors
///
/// Returns an error if the `HciLayer` is not initialized.
pub async fn set_acl_data_sizes(classic: u16, le: u16) -> Result<(), Error> {
    let mut layer = hci_layer().await.map_err(|_| Error::NotInitialized)?;
    layer.set_acl_data_sizes(classic, le);
    Ok(())
}

/// Wait for the next event or reassembled ACL packet from the controller.
pub async fn next_upward_packet() -> HciPacket {
    UPWARD_CHANNEL.receiver().receive().await
}

/// Queue an access message for the mesh transport processor.
///
/// The outcome is reported through the transport's
/// [`UpperLayer`](crate::mesh::UpperLayer) callbacks under `tag`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidLength`] if `sdu` is empty or does not
/// fit a segmented message.
pub async fn mesh_send(tx: NetTx, sdu: &[u8], tag: MessageTag) -> Result<(), Error> {
    if sdu.is_empty() {
        return Err(TransportError::InvalidLength.into());
    }
    let sdu = Vec::from_slice(sdu).map_err(|()| TransportError::InvalidLength)?;
    MESH_CHANNEL
        .sender()
        .send(MeshRequest::Send { tx, sdu, tag })
        .await;
    Ok(())
}

/// Queue a transport control message for the mesh transport processor.
///
/// # Errors
///
/// Returns [`TransportError::InvalidLength`] if `payload` is empty or too
/// long.
pub async fn mesh_send_control(
    tx: NetTx,
    opcode: u8,
    payload: &[u8],
    tag: MessageTag,
) -> Result<(), Error> {
    if payload.is_empty() {
        return Err(TransportError::InvalidLength.into());
    }
    let payload = Vec::from_slice(payload).map_err(|()| TransportError::InvalidLength)?;
    MESH_CHANNEL
        .sender()
        .send(MeshRequest::SendControl {
            tx,
            opcode,
            payload,
            tag,
        })
        .await;
    Ok(())
}

/// Hand a decrypted lower transport PDU to the mesh transport processor.
///
/// # Errors
///
/// Returns [`TransportError::InvalidLength`] if `pdu` is longer than a lower
/// transport PDU.
pub async fn mesh_receive(rx: NetRx, pdu: &[u8]) -> Result<(), Error> {
    let pdu: Vec<u8, TRANSPORT_PDU_MAX> =
        Vec::from_slice(pdu).map_err(|()| TransportError::InvalidLength)?;
    MESH_CHANNEL
        .sender()
        .send(MeshRequest::Receive { rx, pdu })
        .await;
    Ok(())
}

/// Report that the network layer started transmitting a PDU.
pub async fn mesh_send_start(token: SendToken, duration: u16, result: Result<(), TransportError>) {
    MESH_CHANNEL
        .sender()
        .send(MeshRequest::SendStart {
            token,
            duration,
            result,
        })
        .await;
}

/// Report that the network layer finished transmitting a PDU.
pub async fn mesh_send_end(token: SendToken) {
    MESH_CHANNEL
        .sender()
        .send(MeshRequest::SendEnd { token })
        .await;
}

/// Ask the mesh transport to resume the IV update once segmented
/// transmission is idle.
pub async fn mesh_defer_iv_update() {
    MESH_CHANNEL.sender().send(MeshRequest::DeferIvUpdate).await;
}

/// Roll the Replay Protection List over to a new IV index.
pub async fn mesh_iv_update() {
    MESH_CHANNEL.sender().send(MeshRequest::IvUpdate).await;
}

/// Drop all segmentation state; outbound messages end with
/// [`TransportError::Canceled`].
pub async fn mesh_reset() {
    MESH_CHANNEL.sender().send(MeshRequest::Reset).await;
}

/// Forget a removed node: its segmentation state and replay entry.
pub async fn mesh_reset_node(addr: u16) {
    MESH_CHANNEL.sender().send(MeshRequest::ResetNode(addr)).await;
}
