#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod fmt;

pub mod api;
pub mod constants;
pub mod hci;
pub mod mesh;
pub mod pool;
pub mod processor;

use crate::constants::{
    COMMAND_TIMEOUT_MS, DEFAULT_ACL_DATA_SIZE_CLASSIC, DEFAULT_ACL_DATA_SIZE_LE, MAX_CHANNELS,
    TRANSPORT_PDU_MAX, TX_SDU_MAX,
};
use crate::hci::command::CommandSignal;
use crate::hci::layer::HciLayer;
use crate::hci::{HciError, HciPacket};
use crate::mesh::{MessageTag, NetRx, NetTx, SendToken, TransportError};
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    mutex::{MappedMutexGuard, Mutex, MutexGuard},
};
use heapless::Vec;

/// Events and reassembled ACL packets for the upper layers
pub(crate) static UPWARD_CHANNEL: Channel<CriticalSectionRawMutex, HciPacket, MAX_CHANNELS> =
    Channel::new();

/// Requests for the mesh transport processor
pub(crate) static MESH_CHANNEL: Channel<CriticalSectionRawMutex, MeshRequest, MAX_CHANNELS> =
    Channel::new();

/// Wakes the HCI transmit processor when there may be something to send
pub(crate) static HCI_TX_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Completion for commands issued through [`api::send_command`]
pub(crate) static COMMAND_SIGNAL: CommandSignal = Signal::new();

/// Serialises API callers so that one [`COMMAND_SIGNAL`] suffices
pub(crate) static COMMAND_LOCK: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());

/// Global `HciLayer`, initialized by client at runtime
pub(crate) static HCI_LAYER: Mutex<CriticalSectionRawMutex, Option<HciLayer>> = Mutex::new(None);

/// Initialize the global `HciLayer` with the given options.
///
/// This function must be called before using any API functions or spawning the processor tasks.
///
/// # Errors
///
/// This function will return an error if the `HciLayer` has already been initialized.
///
/// # Example
///
/// ```rust,no_run
/// use meshbird::{init_hci_layer, HciOptions};
///
/// # async fn example() -> Result<(), &'static str> {
/// init_hci_layer(HciOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn init_hci_layer(options: HciOptions) -> Result<(), &'static str> {
    let mut guard = HCI_LAYER.lock().await;
    if guard.is_some() {
        return Err("HciLayer already initialized");
    }
    *guard = Some(HciLayer::new(&options));
    Ok(())
}

/// Get a locked reference to the global `HciLayer`.
///
/// Primarily intended for the processor tasks. API users should use the
/// functions in the [`api`] module instead.
///
/// # Errors
///
/// This function will return an error if the `HciLayer` has not been initialized.
pub async fn hci_layer<'a>()
-> Result<MappedMutexGuard<'a, CriticalSectionRawMutex, HciLayer>, &'static str> {
    let guard = HCI_LAYER.lock().await;
    if guard.is_none() {
        return Err("HciLayer not initialized");
    }
    // Checked above, the default is never constructed
    Ok(MutexGuard::map(guard, |layer| {
        layer.get_or_insert_with(HciLayer::default)
    }))
}

/// Options for configuring the `HciLayer`
///
/// # Examples
///
/// ```rust
/// use meshbird::HciOptions;
///
/// // Controller with a small LE buffer and a slow firmware
/// let options = HciOptions {
///     command_timeout_ms: 10_000,
///     acl_data_size_le: 27,
///     ..HciOptions::default()
/// };
/// assert_eq!(options.acl_data_size_classic, 1021);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HciOptions {
    /// Watchdog timeout for an outstanding command in milliseconds
    pub command_timeout_ms: u64,
    /// Classic ACL data length until the controller reports its own
    pub acl_data_size_classic: u16,
    /// LE ACL data length until the controller reports its own; `0` shares
    /// the classic buffers
    pub acl_data_size_le: u16,
}

impl Default for HciOptions {
    fn default() -> Self {
        Self {
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            acl_data_size_classic: DEFAULT_ACL_DATA_SIZE_CLASSIC,
            acl_data_size_le: DEFAULT_ACL_DATA_SIZE_LE,
        }
    }
}

/// Work items for [`processor::mesh_transport_processor`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MeshRequest {
    /// Send an access SDU
    Send {
        /// Message parameters
        tx: NetTx,
        /// Upper transport PDU
        sdu: Vec<u8, TX_SDU_MAX>,
        /// Echoed in the completion callbacks
        tag: MessageTag,
    },
    /// Send a transport control message
    SendControl {
        /// Message parameters
        tx: NetTx,
        /// Control opcode
        opcode: u8,
        /// Control parameters
        payload: Vec<u8, TX_SDU_MAX>,
        /// Echoed in the completion callbacks
        tag: MessageTag,
    },
    /// Lower transport PDU decrypted by the network layer
    Receive {
        /// Network metadata
        rx: NetRx,
        /// Lower transport PDU
        pdu: Vec<u8, TRANSPORT_PDU_MAX>,
    },
    /// The network layer started transmitting a PDU
    SendStart {
        /// PDU identifier
        token: SendToken,
        /// Estimated transmission time in milliseconds
        duration: u16,
        /// Whether the transmission could start
        result: Result<(), TransportError>,
    },
    /// The network layer finished transmitting a PDU
    SendEnd {
        /// PDU identifier
        token: SendToken,
    },
    /// Resume the IV update procedure once segmented TX is idle
    DeferIvUpdate,
    /// Roll the Replay Protection List over to a new IV index
    IvUpdate,
    /// Drop all segmentation state
    Reset,
    /// Forget a removed node
    ResetNode(u16),
}

/// Errors reported by the async API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// HCI transport failure
    Hci(HciError),
    /// Mesh lower transport failure
    Transport(TransportError),
    /// `init_hci_layer` has not been called
    NotInitialized,
}

impl From<HciError> for Error {
    fn from(err: HciError) -> Self {
        Error::Hci(err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Hci(err) => write!(f, "HCI: {err}"),
            Error::Transport(err) => write!(f, "Transport: {err}"),
            Error::NotInitialized => write!(f, "Not initialized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        assert_eq!(Error::from(HciError::QueueFull), Error::Hci(HciError::QueueFull));
        assert_eq!(
            Error::from(TransportError::Busy),
            Error::Transport(TransportError::Busy)
        );
    }

    #[test]
    fn test_default_options() {
        let options = HciOptions::default();
        assert_eq!(options.command_timeout_ms, 8_000);
        assert_eq!(options.acl_data_size_le, 251);
    }
}
