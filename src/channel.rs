use crate::{
    config::{ChannelConfig, ChannelType},
    message::NetworkMessage,
};

use self::{processor::Processor, reliable::Reliable, unreliable::Unreliable};

mod bit_array;
mod channel_packet_data;
mod processor;
mod reliable;
mod sequence_buffer;
mod unreliable;

pub(crate) use channel_packet_data::ChannelPacketData;

/// Headroom reserved per message for the bookkeeping around its body
/// (count field, id encoding slack). Used when budgeting, never on the wire.
pub(crate) const CONSERVATIVE_MESSAGE_HEADER_BITS: usize = 32;
/// Headroom reserved for a block fragment's header fields.
pub(crate) const CONSERVATIVE_FRAGMENT_HEADER_BITS: usize = 64;
/// Headroom reserved per channel entry in a packet.
pub(crate) const CONSERVATIVE_CHANNEL_HEADER_BITS: usize = 32;
/// Headroom reserved for the packet-level prefix.
pub(crate) const CONSERVATIVE_PACKET_HEADER_BITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorLevel {
    /// No error. All is well.
    None,
    /// This channel has desynced. The connection protocol cannot recover;
    /// the peer should be disconnected.
    ///
    /// The usual cause is a receiver that stops dequeueing messages: the
    /// receive window falls behind and newer ids have nowhere to go.
    Desync,
    /// The user tried to send a message but the send queue was full.
    ///
    /// Either messages are being sent too fast, or (on reliable channels)
    /// nothing is coming back from the peer to ack them. Acks are per
    /// packet, so the peer sending anything at all on any channel is
    /// enough to drain the send queue.
    SendQueueFull,
    /// The channel received block data but is configured to disable
    /// blocks. See [`ChannelConfig::disable_blocks`].
    BlocksDisabled,
    /// Serialize read failed for a message sent to this channel. Either a
    /// message serialize function is broken, or the peer desynced message
    /// read and write.
    FailedToSerialize,
    /// The channel tried to allocate memory from a bounded pool and
    /// couldn't. Raised by embedders that wrap allocation; never raised
    /// by this crate under the global allocator.
    OutOfMemory,
}

/// A single logical stream of messages within a connection, with its own
/// reliability semantics, queues and error state.
///
/// The wrapper owns configuration, the latched error level and counters;
/// the per-kind state machines live behind [`Processor`].
pub struct Channel<M> {
    config: ChannelConfig,
    channel_index: usize,
    error_level: ChannelErrorLevel,
    processor: Box<dyn Processor<M>>,
    counters: ChannelCounters,
}

impl<M: NetworkMessage> Channel<M> {
    pub(crate) fn new(config: ChannelConfig, channel_index: usize, time: f64) -> Channel<M> {
        let processor: Box<dyn Processor<M>> = match config.kind {
            ChannelType::ReliableOrdered => Box::new(Reliable::new(config, time)),
            ChannelType::UnreliableUnordered => Box::new(Unreliable::new(config)),
        };
        Channel {
            config,
            channel_index,
            error_level: ChannelErrorLevel::None,
            processor,
            counters: ChannelCounters::default(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.error_level = ChannelErrorLevel::None;
        self.processor.reset();
        self.reset_counters();
    }

    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    pub fn error_level(&self) -> ChannelErrorLevel {
        self.error_level
    }

    /// Advance channel time.
    ///
    /// Called by `Connection::advance_time` for each channel configured on
    /// the connection.
    pub(crate) fn advance_time(&mut self, time: f64) {
        self.processor.advance_time(time);
    }

    pub(crate) fn can_send_message(&self) -> bool {
        self.processor.can_send_message()
    }

    pub(crate) fn has_messages_to_send(&self) -> bool {
        self.processor.has_messages_to_send()
    }

    /// Queue a message to be sent across this channel.
    ///
    /// The message is dropped when the channel is errored, when the send
    /// queue is full, or when it carries a block on a channel with blocks
    /// disabled; the latter two latch the corresponding error level.
    pub(crate) fn send_message(&mut self, message: M) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }

        if !self.can_send_message() {
            self.set_error_level(ChannelErrorLevel::SendQueueFull);
            return;
        }

        if message.is_block() && self.config.disable_blocks {
            self.set_error_level(ChannelErrorLevel::BlocksDisabled);
            return;
        }

        self.processor.send_message(message);

        self.counters.sent += 1;
    }

    /// Pop the next message off the receive queue, with the id it was
    /// delivered under.
    pub(crate) fn receive_message(&mut self) -> Option<(u16, M)> {
        if self.error_level != ChannelErrorLevel::None {
            return None;
        }

        let received = self.processor.receive_message()?;

        self.counters.received += 1;

        Some(received)
    }

    /// Get channel packet data for this channel, within `available_bits`.
    ///
    /// Returns the emitted payload and the (conservative) bits it costs;
    /// zero bits means nothing to send this packet.
    pub(crate) fn packet_data(
        &mut self,
        packet_sequence: u16,
        available_bits: usize,
        message_type_bits: usize,
    ) -> (ChannelPacketData<M>, usize) {
        if self.error_level != ChannelErrorLevel::None {
            return (ChannelPacketData::empty(), 0);
        }
        self.processor.packet_data(
            self.channel_index,
            packet_sequence,
            available_bits,
            message_type_bits,
        )
    }

    pub(crate) fn process_packet_data(
        &mut self,
        packet_data: ChannelPacketData<M>,
        packet_sequence: u16,
    ) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        if packet_data.message_failed_to_serialize {
            self.set_error_level(ChannelErrorLevel::FailedToSerialize);
            return;
        }
        if let Err(level) = self.processor.process_packet_data(packet_data, packet_sequence) {
            self.set_error_level(level);
        }
    }

    pub(crate) fn process_ack(&mut self, packet_sequence: u16) {
        if self.error_level != ChannelErrorLevel::None {
            return;
        }
        self.processor.process_ack(packet_sequence);
    }

    /// All errors go through this function to make debug logging easier.
    fn set_error_level(&mut self, level: ChannelErrorLevel) {
        if self.error_level != level && level != ChannelErrorLevel::None {
            log::error!(
                "channel {} went into error state: {:?}",
                self.channel_index,
                level
            );
        }
        self.error_level = level;
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct ChannelCounters {
    pub sent: usize,
    pub received: usize,
}

impl ChannelCounters {
    fn reset(&mut self) {
        self.sent = 0;
        self.received = 0;
    }
}
