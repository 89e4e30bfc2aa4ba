//! Framing contract between transports and wire protocols.
//!
//! A transport never parses bytes itself. It asks the protocol how many bytes
//! it wants, reads at most that many into the slice returned by
//! [`Protocol::write_pos`], reports the count with
//! [`Protocol::on_bytes_received`] and repeats until the packet is complete
//! or the protocol reports an error. Outbound packets are written from
//! [`Disassembly::data`].

/// Outbound side of the contract: a fully serialized packet.
pub trait Disassembly {
    /// Total number of bytes to put on the wire.
    fn send_length(&self) -> usize;

    /// The serialized packet.
    fn data(&self) -> &[u8];
}

/// Inbound side of the contract: incremental packet assembly.
///
/// Implementations keep their parse state between calls; the packet being
/// assembled is owned by the transport and passed in on every call.
pub trait Protocol: Send + 'static {
    /// Packet type produced on the inbound side and consumed on the outbound side.
    type Packet: Disassembly + Default + Send + 'static;

    /// Number of bytes wanted right now.
    ///
    /// Never zero while a packet is being assembled.
    fn wanted_amount(&mut self, packet: &mut Self::Packet) -> usize;

    /// Destination for the next read.
    ///
    /// The protocol grows the packet buffer before returning so the slice is
    /// always at least [`Protocol::wanted_amount`] bytes long.
    fn write_pos<'a>(&mut self, packet: &'a mut Self::Packet) -> &'a mut [u8];

    /// Account for `length` bytes written at the write position.
    fn on_bytes_received(&mut self, packet: &mut Self::Packet, length: usize);

    /// Whether the packet is fully assembled.
    fn is_complete(&self, packet: &Self::Packet) -> bool;

    /// Whether an unrecoverable framing error occurred for the current packet.
    fn is_error(&self) -> bool;

    /// Prepare for the next packet after a complete one was handed off.
    fn packet_consumed(&mut self);

    /// Return to the initial parse state, discarding any partial packet state.
    fn reset(&mut self);
}
