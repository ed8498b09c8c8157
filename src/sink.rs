//! Raw frame output. The engine drives any `PacketSink`; production use
//! goes through a pnet datalink channel bound to one interface.

use std::io;

use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};

use crate::error::TxError;
use crate::sequence::PacketSequence;

/// Where raw frames go.
pub trait PacketSink {
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<()>;

    /// True when the sink can transmit a whole pre-serialized sequence on
    /// its own (the batched fast path).
    fn supports_send_queue(&self) -> bool {
        false
    }

    /// Transmit a whole sequence, honoring inter-packet gaps when `sync` is
    /// set. Only called when `supports_send_queue` returns true.
    fn send_queue(&mut self, _seq: &PacketSequence, _sync: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "send_queue not supported by this sink",
        ))
    }
}

/// Sends frames through a pnet datalink channel.
pub struct DatalinkSink {
    tx: Box<dyn DataLinkSender>,
}

impl DatalinkSink {
    /// Open the named interface for raw ethernet output.
    pub fn open(device: &str) -> Result<Self, TxError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface: &NetworkInterface| iface.name == device)
            .ok_or_else(|| TxError::DeviceOpen {
                device: device.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such interface"),
            })?;
        match datalink::channel(&interface, Default::default()) {
            Ok(Channel::Ethernet(tx, _rx)) => Ok(DatalinkSink { tx }),
            Ok(_) => Err(TxError::DeviceOpen {
                device: device.to_string(),
                source: io::Error::new(io::ErrorKind::Unsupported, "unhandled channel type"),
            }),
            Err(e) => Err(TxError::DeviceOpen {
                device: device.to_string(),
                source: e,
            }),
        }
    }
}

impl PacketSink for DatalinkSink {
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        match self.tx.send_to(packet, None) {
            Some(res) => res,
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "link-layer send unavailable",
            )),
        }
    }
}
