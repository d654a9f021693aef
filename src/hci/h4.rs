//! H4 (UART) framing
//!
//! Every packet on the wire is prefixed by its one-byte [`PacketKind`]
//! indicator, followed by the type-specific header and body. [`H4Framer`]
//! recovers packets from the receive stream one byte at a time;
//! [`encode`] produces the transmit form.
//!
//! [`H4Transport`] wraps one half of an `embedded-io-async` byte stream:
//! wrap the UART receiver to get an [`HciRead`], the UART transmitter to get
//! an [`HciWrite`].

use super::{HciError, HciPacket, PacketKind, body_len, preamble_len};
use bt_hci::FromHciBytes;
use crate::constants::{MAX_HCI_PACKET_SIZE, READ_BUFFER_SIZE};
use heapless::Vec;

/// Source of inbound HCI packets
#[allow(async_fn_in_trait)]
pub trait HciRead {
    /// Wait for the next complete packet from the controller
    ///
    /// # Errors
    ///
    /// Returns [`HciError::Transport`] if the underlying stream fails.
    async fn read_packet(&mut self) -> Result<HciPacket, HciError>;
}

/// Sink for outbound HCI packets
#[allow(async_fn_in_trait)]
pub trait HciWrite {
    /// Send one packet to the controller
    ///
    /// # Errors
    ///
    /// Returns [`HciError::Transport`] if the underlying stream fails.
    async fn write_packet(&mut self, packet: &HciPacket) -> Result<(), HciError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Waiting for a packet indicator
    BrandNew,
    /// Collecting the type-specific header
    Preamble,
    /// Collecting the body
    Body,
}

/// Byte-at-a-time H4 receive framer
#[derive(Debug)]
pub struct H4Framer {
    state: FrameState,
    kind: PacketKind,
    remaining: usize,
    discard: bool,
    buf: Vec<u8, MAX_HCI_PACKET_SIZE>,
}

impl Default for H4Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl H4Framer {
    /// Create a framer waiting for a packet indicator
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: FrameState::BrandNew,
            kind: PacketKind::Event,
            remaining: 0,
            discard: false,
            buf: Vec::new(),
        }
    }

    /// Feed one byte, returning a packet once it is complete.
    pub fn push(&mut self, byte: u8) -> Option<HciPacket> {
        match self.state {
            FrameState::BrandNew => {
                let Ok((kind, _)) = PacketKind::from_hci_bytes(&[byte]) else {
                    warn!("[H4] Unknown packet type {:#x}, skipping", byte);
                    return None;
                };
                self.kind = kind;
                self.buf.clear();
                self.discard = false;
                self.remaining = preamble_len(kind);
                self.state = FrameState::Preamble;
                None
            }
            FrameState::Preamble => {
                // The preamble always fits
                let _ = self.buf.push(byte);
                self.remaining -= 1;
                if self.remaining > 0 {
                    return None;
                }

                self.remaining = body_len(self.kind, &self.buf);
                if self.buf.len() + self.remaining > MAX_HCI_PACKET_SIZE {
                    warn!(
                        "[H4] {:?} packet of {} bytes exceeds buffer, ignoring",
                        self.kind,
                        self.remaining
                    );
                    self.discard = true;
                }
                if self.remaining == 0 {
                    return self.finish();
                }
                self.state = FrameState::Body;
                None
            }
            FrameState::Body => {
                if !self.discard {
                    let _ = self.buf.push(byte);
                }
                self.remaining -= 1;
                if self.remaining == 0 {
                    return self.finish();
                }
                None
            }
        }
    }

    fn finish(&mut self) -> Option<HciPacket> {
        self.state = FrameState::BrandNew;
        if self.discard {
            self.discard = false;
            return None;
        }
        trace!("[H4] Received {:?} packet, {} bytes", self.kind, self.buf.len());
        HciPacket::new(self.kind, &self.buf).ok()
    }
}

/// Write the H4 form of `packet` into `out`, returning the number of bytes.
///
/// # Errors
///
/// Returns [`HciError::PacketTooLarge`] if `out` cannot hold the packet.
pub fn encode(packet: &HciPacket, out: &mut [u8]) -> Result<usize, HciError> {
    let data = packet.as_bytes();
    let len = data.len() + 1;
    let out = out.get_mut(..len).ok_or(HciError::PacketTooLarge)?;
    out[0] = packet.kind() as u8;
    out[1..].copy_from_slice(data);
    Ok(len)
}

/// H4 transport over one half of an `embedded-io-async` stream
pub struct H4Transport<T> {
    io: T,
    framer: H4Framer,
    buf: [u8; READ_BUFFER_SIZE],
    start: usize,
    end: usize,
}

impl<T> H4Transport<T> {
    /// Wrap a byte stream
    pub fn new(io: T) -> Self {
        Self {
            io,
            framer: H4Framer::new(),
            buf: [0; READ_BUFFER_SIZE],
            start: 0,
            end: 0,
        }
    }

    /// Return the wrapped stream
    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: embedded_io_async::Read> HciRead for H4Transport<T> {
    async fn read_packet(&mut self) -> Result<HciPacket, HciError> {
        loop {
            while self.start < self.end {
                let byte = self.buf[self.start];
                self.start += 1;
                if let Some(packet) = self.framer.push(byte) {
                    return Ok(packet);
                }
            }

            let n = self
                .io
                .read(&mut self.buf)
                .await
                .map_err(|_| HciError::Transport)?;
            if n == 0 {
                return Err(HciError::Transport);
            }
            self.start = 0;
            self.end = n;
        }
    }
}

impl<T: embedded_io_async::Write> HciWrite for H4Transport<T> {
    async fn write_packet(&mut self, packet: &HciPacket) -> Result<(), HciError> {
        self.io
            .write_all(&[packet.kind() as u8])
            .await
            .map_err(|_| HciError::Transport)?;
        self.io
            .write_all(packet.as_bytes())
            .await
            .map_err(|_| HciError::Transport)?;
        self.io.flush().await.map_err(|_| HciError::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embassy_futures::block_on;

    struct Sink {
        written: Vec<u8, 64>,
    }

    impl embedded_io_async::ErrorType for Sink {
        type Error = Infallible;
    }

    impl embedded_io_async::Write for Sink {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            let n = buf.len().min(self.written.capacity() - self.written.len());
            let _ = self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    fn feed(framer: &mut H4Framer, bytes: &[u8]) -> Vec<HciPacket, 4> {
        let mut out = Vec::new();
        for byte in bytes {
            if let Some(packet) = framer.push(*byte) {
                out.push(packet).unwrap();
            }
        }
        out
    }

    #[test]
    fn test_framer_event_and_acl() {
        let mut framer = H4Framer::new();
        let stream = [
            0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00, // Command Complete
            0x02, 0x01, 0x20, 0x02, 0x00, 0xAA, 0xBB, // ACL
        ];

        let packets = feed(&mut framer, &stream);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].kind(), PacketKind::Event);
        assert_eq!(packets[0].as_bytes(), &stream[1..7]);
        assert_eq!(packets[1].kind(), PacketKind::AclData);
        assert_eq!(packets[1].payload(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_framer_skips_unknown_type() {
        let mut framer = H4Framer::new();
        let packets = feed(&mut framer, &[0xFF, 0x00, 0x04, 0x13, 0x00]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_bytes(), &[0x13, 0x00]);
    }

    #[test]
    fn test_framer_ignores_oversize_body() {
        let mut framer = H4Framer::new();
        let len: u16 = 1100;
        let mut packets = feed(&mut framer, &[0x02, 0x01, 0x20]);
        packets.extend(feed(&mut framer, &len.to_le_bytes()));
        for _ in 0..len {
            assert!(framer.push(0x55).is_none());
        }
        assert!(packets.is_empty());

        // Back in sync for the next packet
        let packets = feed(&mut framer, &[0x04, 0x13, 0x00]);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_encode() {
        let packet = HciPacket::new(PacketKind::Cmd, &[0x03, 0x0C, 0x00]).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(encode(&packet, &mut out), Ok(4));
        assert_eq!(&out[..4], &[0x01, 0x03, 0x0C, 0x00]);

        let mut short = [0u8; 3];
        assert_eq!(encode(&packet, &mut short), Err(HciError::PacketTooLarge));
    }

    #[test]
    fn test_transport_read_and_write() {
        let stream: &[u8] = &[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00, 0x04, 0x13];
        let mut rx = H4Transport::new(stream);

        let packet = block_on(rx.read_packet()).unwrap();
        assert_eq!(packet.as_bytes(), &[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        // Stream ends mid-packet
        assert_eq!(block_on(rx.read_packet()), Err(HciError::Transport));

        let mut tx = H4Transport::new(Sink { written: Vec::new() });
        let command = HciPacket::new(PacketKind::Cmd, &[0x03, 0x0C, 0x00]).unwrap();
        block_on(tx.write_packet(&command)).unwrap();
        assert_eq!(tx.into_inner().written.as_slice(), &[0x01, 0x03, 0x0C, 0x00]);
    }
}
