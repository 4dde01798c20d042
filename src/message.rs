use crate::serialize::{SerializeError, Stream};

/// A message that can be sent and received from the network.
///
/// `serialize` is dual-use: the one routine runs against the write, read
/// and measure streams. In write and measure mode it reads the fields; in
/// read mode it fills them in on a message freshly produced by the
/// factory.
///
/// Messages are owned values. Where a refcounted design would acquire a
/// reference (send queue into packet data, fragment zero of a block) this
/// crate clones, and dropping releases.
pub trait NetworkMessage: Clone + 'static {
    /// The wire tag for this message, `0..num_types` of the factory that
    /// produced it.
    fn type_index(&self) -> usize;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), SerializeError>;

    /// True for messages that carry a data block.
    ///
    /// A block message owns its bytes exclusively. On a reliable channel
    /// the block travels as fragments; on an unreliable channel it is
    /// serialized inline with the message.
    ///
    /// Must depend only on the message type, never on whether bytes are
    /// currently attached: the receive side consults it on freshly created
    /// messages to decide what to read off the wire.
    fn is_block(&self) -> bool {
        false
    }

    /// The attached block. Empty until a block is attached.
    fn block(&self) -> &[u8] {
        &[]
    }

    /// Attach block data. Only invoked on messages reporting `is_block`.
    fn attach_block(&mut self, data: Vec<u8>) {
        let _ = data;
        debug_assert!(false, "attach_block on a non-block message");
    }
}

/// Creates messages by type index, for the receive side of the wire.
///
/// `num_types` bounds the type tag on the wire: every message type costs
/// `bits_required(0, num_types - 1)` bits to name.
pub trait MessageFactory {
    type Message: NetworkMessage;

    /// Number of message types this factory can create.
    fn num_types(&self) -> usize;

    /// Create a default-initialized message ready for serialize read.
    ///
    /// Returns `None` for an out-of-range type index; the caller treats
    /// that as a failed read.
    fn create_message(&self, type_index: usize) -> Option<Self::Message>;
}
