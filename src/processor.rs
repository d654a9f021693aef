//! Processor Tasks - HCI transmit, HCI receive and mesh transport processing
//!
//! The engines in [`hci`](crate::hci) and [`mesh`](crate::mesh) are plain
//! state machines; the tasks in this module feed them, write their output to
//! the controller and sleep until their next timer deadline.
//!
//! # Architecture
//!
//! * **HCI transmit**: drains the command queue (credits permitting) before
//!   the packet queue, fragmenting ACL data, and fires the command watchdog
//! * **HCI receive**: frames controller bytes into packets, consumes command
//!   responses and forwards events and reassembled ACL data upward
//! * **Mesh transport**: serves [`MeshRequest`]s and fires the segmentation
//!   timers
//!
//! # Example
//!
//! ```rust,ignore
//! use meshbird::hci::h4::H4Transport;
//! use meshbird::{processor, HciOptions};
//!
//! #[embassy_executor::task]
//! async fn bluetooth(uart: BufferedUart<'static>) {
//!     let (rx, tx) = uart.split();
//!     processor::run(HciOptions::default(), H4Transport::new(rx), H4Transport::new(tx)).await;
//! }
//! ```

use crate::constants::HCI_READ_RETRY_MS;
use crate::hci::h4::{HciRead, HciWrite};
use crate::mesh::replay::ReplayStore;
use crate::mesh::transport::MeshTransport;
use crate::mesh::{NetworkLayer, UpperLayer};
use crate::{HCI_TX_SIGNAL, HciOptions, MESH_CHANNEL, MeshRequest, UPWARD_CHANNEL, hci_layer};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Instant, Timer};

async fn hci_tx_processor<W: HciWrite>(mut writer: W) -> ! {
    loop {
        let (packet, deadline) = match hci_layer().await {
            Ok(mut layer) => {
                let now = Instant::now();
                layer.poll(now);
                (layer.next_outbound(now), layer.next_deadline())
            }
            Err(e) => {
                error!("[PROCESSOR] HciLayer not initialized: {}", e);
                (None, None)
            }
        };

        if let Some(packet) = packet {
            trace!("[PROCESSOR] HCI tx {:?}", packet.kind());
            if let Err(e) = writer.write_packet(&packet).await {
                error!("[PROCESSOR] HCI write error: {:?}", e);
            }
            continue;
        }

        select(
            HCI_TX_SIGNAL.wait(),
            Timer::at(deadline.unwrap_or(Instant::MAX)),
        )
        .await;
    }
}

async fn hci_rx_processor<R: HciRead>(mut reader: R) -> ! {
    loop {
        let packet = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                // A closed stream keeps failing, do not spin on it
                error!("[PROCESSOR] HCI read error: {:?}", e);
                Timer::after_millis(HCI_READ_RETRY_MS).await;
                continue;
            }
        };
        trace!("[PROCESSOR] HCI rx {:?}", packet.kind());

        let upward = match hci_layer().await {
            Ok(mut layer) => layer.on_inbound(packet),
            Err(e) => {
                error!("[PROCESSOR] HciLayer not initialized: {}", e);
                None
            }
        };
        // Credits may have been granted
        HCI_TX_SIGNAL.signal(());

        if let Some(packet) = upward {
            UPWARD_CHANNEL.sender().send(packet).await;
        }
    }
}

/// Drive a [`MeshTransport`] from the mesh request channel.
///
/// The transport lives behind an application-owned mutex so that the network
/// layer can reach it too. Requests come from the functions in
/// [`api`](crate::api); timers are fired as their deadlines pass. A send that
/// is rejected outright is reported through [`UpperLayer::send_end`].
pub async fn mesh_transport_processor<M, N, U, S>(
    transport: &Mutex<M, MeshTransport<N, U, S>>,
) -> !
where
    M: RawMutex,
    N: NetworkLayer,
    U: UpperLayer,
    S: ReplayStore,
{
    let receiver = MESH_CHANNEL.receiver();

    loop {
        let deadline = transport.lock().await.next_deadline();
        let request = match select(
            receiver.receive(),
            Timer::at(deadline.unwrap_or(Instant::MAX)),
        )
        .await
        {
            Either::First(request) => Some(request),
            Either::Second(()) => None,
        };

        let mut transport = transport.lock().await;
        let now = Instant::now();
        match request {
            Some(request) => {
                debug!("[PROCESSOR] Mesh request: {:?}", request);
                process_mesh_request(&mut transport, request, now);
            }
            None => transport.poll(now),
        }
    }
}

fn process_mesh_request<N: NetworkLayer, U: UpperLayer, S: ReplayStore>(
    transport: &mut MeshTransport<N, U, S>,
    request: MeshRequest,
    now: Instant,
) {
    match request {
        MeshRequest::Send { tx, sdu, tag } => {
            if let Err(e) = transport.send(&tx, &sdu, tag) {
                warn!("[PROCESSOR] Mesh send to {:#x} failed: {:?}", tx.dst, e);
                transport.upper_mut().send_end(tag, Err(e));
            }
        }
        MeshRequest::SendControl {
            tx,
            opcode,
            payload,
            tag,
        } => {
            if let Err(e) = transport.send_ctl(&tx, opcode, &payload, tag) {
                warn!("[PROCESSOR] Mesh control send to {:#x} failed: {:?}", tx.dst, e);
                transport.upper_mut().send_end(tag, Err(e));
            }
        }
        MeshRequest::Receive { rx, pdu } => {
            if let Err(e) = transport.recv(&rx, &pdu, now) {
                debug!("[PROCESSOR] Mesh PDU from {:#x} dropped: {:?}", rx.src, e);
            }
        }
        MeshRequest::SendStart {
            token,
            duration,
            result,
        } => transport.on_send_start(token, duration, result, now),
        MeshRequest::SendEnd { token } => transport.on_send_end(token, now),
        MeshRequest::DeferIvUpdate => transport.defer_iv_update(),
        MeshRequest::IvUpdate => {
            transport.iv_update();
        }
        MeshRequest::Reset => {
            transport.tx_reset();
            transport.rx_reset();
        }
        MeshRequest::ResetNode(addr) => {
            transport.tx_reset_single(addr);
            transport.rx_reset_single(addr);
        }
    }
}

/// Initialize the `HciLayer` and run the HCI transmit and receive tasks.
///
/// Returns immediately if the `HciLayer` was already initialized.
pub async fn run<R: HciRead, W: HciWrite>(options: HciOptions, reader: R, writer: W) {
    if let Err(e) = crate::init_hci_layer(options).await {
        error!("[PROCESSOR] {}", e);
        return;
    }

    select(hci_rx_processor(reader), hci_tx_processor(writer)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::{HciError, HciPacket};
    use crate::mesh::testing::{MockNetwork, MockUpper, UpperEvent};
    use crate::mesh::{MessageTag, NetTx, TransportError};
    use core::cell::Cell;
    use core::pin::pin;
    use embassy_futures::poll_once;
    use embassy_time::{Duration, MockDriver};
    use heapless::Vec;

    struct ClosedStream<'a> {
        reads: &'a Cell<usize>,
    }

    impl HciRead for ClosedStream<'_> {
        async fn read_packet(&mut self) -> Result<HciPacket, HciError> {
            self.reads.set(self.reads.get() + 1);
            Err(HciError::Transport)
        }
    }

    #[test]
    fn test_rx_backs_off_after_read_error() {
        let reads = Cell::new(0);
        let mut rx = pin!(hci_rx_processor(ClosedStream { reads: &reads }));

        assert!(poll_once(rx.as_mut()).is_pending());
        assert_eq!(reads.get(), 1);
        assert!(poll_once(rx.as_mut()).is_pending());
        assert_eq!(reads.get(), 1);

        MockDriver::get().advance(Duration::from_millis(HCI_READ_RETRY_MS));
        assert!(poll_once(rx.as_mut()).is_pending());
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn test_rejected_send_reports_end() {
        let mut transport = MeshTransport::new(MockNetwork::default(), MockUpper::default());
        let request = MeshRequest::Send {
            tx: NetTx::new(0, 0x0001, 0x0002, 5),
            sdu: Vec::new(),
            tag: MessageTag(9),
        };

        process_mesh_request(&mut transport, request, Instant::from_millis(0));

        let ends: Vec<&UpperEvent, 4> = transport.upper().ends().collect();
        assert_eq!(
            ends.as_slice(),
            &[&UpperEvent::End(MessageTag(9), Err(TransportError::InvalidLength))]
        );
    }

    #[test]
    fn test_unsegmented_request_is_sent() {
        let mut transport = MeshTransport::new(MockNetwork::default(), MockUpper::default());
        let request = MeshRequest::Send {
            tx: NetTx::new(0, 0x0001, 0x0002, 5),
            sdu: Vec::from_slice(&[0x01, 0x02, 0x03]).unwrap(),
            tag: MessageTag(1),
        };

        process_mesh_request(&mut transport, request, Instant::from_millis(0));

        assert_eq!(transport.network_mut().take_sent().len(), 1);
        assert_eq!(transport.upper().ends().count(), 0);
    }
}
