use crate::{
    channel::{
        Channel, ChannelErrorLevel, ChannelPacketData, CONSERVATIVE_CHANNEL_HEADER_BITS,
        CONSERVATIVE_PACKET_HEADER_BITS,
    },
    config::{ConnectionConfig, MAX_CHANNELS},
    message::{MessageFactory, NetworkMessage},
    serialize::{bits_required, ReadStream, SerializeError, Stream, WriteStream},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionErrorLevel {
    /// No error. All is well.
    None,
    /// A channel is in an error state.
    Channel,
    /// The allocator is in an error state. Raised by embedders that wrap
    /// allocation in a bounded pool.
    Allocator,
    /// The message factory is in an error state. Raised by embedders whose
    /// factories can fail out-of-band.
    MessageFactory,
    /// Failed to read a packet. Received an invalid packet?
    ReadPacketFailed,
}

/// Everything one datagram carries for the message channels: zero or more
/// per-channel payload entries, and a trailing serialize check.
struct ConnectionPacket<M> {
    channel_entries: Vec<ChannelPacketData<M>>,
}

impl<M: NetworkMessage> ConnectionPacket<M> {
    fn serialize<S, F>(
        &mut self,
        stream: &mut S,
        factory: &F,
        config: &ConnectionConfig,
    ) -> Result<(), SerializeError>
    where
        S: Stream,
        F: MessageFactory<Message = M>,
    {
        let mut num_entries = self.channel_entries.len() as i32;
        stream.serialize_int(&mut num_entries, 0, config.num_channels as i32)?;

        if S::IS_READING {
            self.channel_entries.reserve(num_entries as usize);
            for _ in 0..num_entries {
                let mut entry = ChannelPacketData::empty();
                entry.serialize(stream, factory, config)?;
                let failed = entry.message_failed_to_serialize;
                self.channel_entries.push(entry);
                if failed {
                    // the stream is unusable past a failed message body;
                    // the flagged entry's channel takes it from here
                    return Ok(());
                }
            }
        } else {
            for entry in &mut self.channel_entries {
                entry.serialize(stream, factory, config)?;
            }
        }

        stream.serialize_check()
    }
}

/// Multiplexes message channels over a stream of sequenced, acked
/// datagrams.
///
/// The connection owns one [`Channel`] per configured channel. Outbound,
/// [`generate_packet`](Connection::generate_packet) polls the channels in
/// index order under the packet's bit budget and serializes what they emit.
/// Inbound, [`process_packet`](Connection::process_packet) deserializes and
/// hands each entry to its channel, and
/// [`process_acks`](Connection::process_acks) forwards datagram-level acks
/// so reliable channels can retire messages and fragments.
///
/// All methods are synchronous and must be called from a single thread;
/// time only moves when the caller passes it to
/// [`advance_time`](Connection::advance_time).
pub struct Connection<F: MessageFactory> {
    config: ConnectionConfig,
    factory: F,
    channels: Vec<Channel<F::Message>>,
    error_level: ConnectionErrorLevel,
}

impl<F: MessageFactory> Connection<F> {
    pub fn new(factory: F, config: ConnectionConfig, time: f64) -> Connection<F> {
        assert!(config.num_channels >= 1 && config.num_channels <= MAX_CHANNELS);
        assert!(factory.num_types() >= 1);
        let channels = (0..config.num_channels)
            .map(|channel_index| Channel::new(config.channels[channel_index], channel_index, time))
            .collect();
        Connection {
            config,
            factory,
            channels,
            error_level: ConnectionErrorLevel::None,
        }
    }

    pub fn error_level(&self) -> ConnectionErrorLevel {
        self.error_level
    }

    pub fn message_factory(&self) -> &F {
        &self.factory
    }

    pub fn channel(&self, channel_index: usize) -> &Channel<F::Message> {
        &self.channels[channel_index]
    }

    pub fn can_send_message(&self, channel_index: usize) -> bool {
        self.channels[channel_index].can_send_message()
    }

    pub fn has_messages_to_send(&self, channel_index: usize) -> bool {
        self.channels[channel_index].has_messages_to_send()
    }

    pub fn send_message(&mut self, channel_index: usize, message: F::Message) {
        self.channels[channel_index].send_message(message)
    }

    pub fn receive_message(&mut self, channel_index: usize) -> Option<(u16, F::Message)> {
        self.channels[channel_index].receive_message()
    }

    /// Build the packet with sequence `packet_sequence` into `packet_data`.
    ///
    /// Returns the number of bytes written, or 0 on failure. A packet with
    /// no channel payloads is still produced (header only), so the layer
    /// below always has something to sequence and ack.
    pub fn generate_packet(&mut self, packet_sequence: u16, packet_data: &mut [u8]) -> usize {
        if self.error_level != ConnectionErrorLevel::None {
            return 0;
        }
        debug_assert!(packet_data.len() * 8 > CONSERVATIVE_PACKET_HEADER_BITS);

        let message_type_bits = bits_required(0, self.factory.num_types() as i32 - 1);

        let mut channel_entries = Vec::new();
        let mut available_bits = packet_data.len() * 8 - CONSERVATIVE_PACKET_HEADER_BITS;

        for channel in &mut self.channels {
            let (entry, bits) =
                channel.packet_data(packet_sequence, available_bits, message_type_bits);
            if bits > 0 {
                debug_assert!(!entry.is_empty());
                available_bits = available_bits.saturating_sub(CONSERVATIVE_CHANNEL_HEADER_BITS);
                available_bits = available_bits.saturating_sub(bits);
                channel_entries.push(entry);
            }
        }

        let mut packet = ConnectionPacket { channel_entries };

        // the bit writer wants a word-sized buffer; stage through scratch
        let mut scratch = vec![0u8; (packet_data.len() + 3) & !3];
        let mut stream = WriteStream::new(&mut scratch);
        if let Err(error) = packet.serialize(&mut stream, &self.factory, &self.config) {
            log::error!("failed to write connection packet: {error}");
            return 0;
        }
        let bytes_written = stream.finish();
        if bytes_written > packet_data.len() {
            log::error!("connection packet overflowed its buffer");
            return 0;
        }
        packet_data[..bytes_written].copy_from_slice(&scratch[..bytes_written]);
        bytes_written
    }

    /// Deserialize the packet with sequence `packet_sequence` and hand each
    /// channel its payload. Returns whether the decode succeeded.
    pub fn process_packet(&mut self, packet_sequence: u16, packet_data: &[u8]) -> bool {
        if self.error_level != ConnectionErrorLevel::None {
            log::debug!("failed to read packet because connection is in error state");
            return false;
        }

        let mut packet = ConnectionPacket {
            channel_entries: Vec::new(),
        };
        let mut stream = ReadStream::new(packet_data);
        if let Err(error) = packet.serialize(&mut stream, &self.factory, &self.config) {
            log::error!("failed to read connection packet: {error}");
            self.set_error_level(ConnectionErrorLevel::ReadPacketFailed);
            return false;
        }

        for entry in packet.channel_entries {
            let channel_index = entry.channel_index;
            debug_assert!(channel_index < self.channels.len());
            self.channels[channel_index].process_packet_data(entry, packet_sequence);
        }
        true
    }

    /// Forward acked datagram sequences to every channel.
    pub fn process_acks(&mut self, acks: &[u16]) {
        for &ack in acks {
            for channel in &mut self.channels {
                channel.process_ack(ack);
            }
        }
    }

    /// Advance channel time and aggregate channel errors up to the
    /// connection.
    pub fn advance_time(&mut self, time: f64) {
        let mut channel_error = false;
        for channel in &mut self.channels {
            channel.advance_time(time);
            channel_error |= channel.error_level() != ChannelErrorLevel::None;
        }
        if channel_error && self.error_level == ConnectionErrorLevel::None {
            self.set_error_level(ConnectionErrorLevel::Channel);
        }
    }

    pub fn reset(&mut self) {
        self.error_level = ConnectionErrorLevel::None;
        for channel in &mut self.channels {
            channel.reset();
        }
    }

    /// All errors go through this function to make debug logging easier.
    fn set_error_level(&mut self, level: ConnectionErrorLevel) {
        if self.error_level != level && level != ConnectionErrorLevel::None {
            log::error!("connection went into error state: {:?}", level);
        }
        self.error_level = level;
    }
}
