use crate::{
    config::{ChannelConfig, ChannelType, ConnectionConfig},
    message::{MessageFactory, NetworkMessage},
    serialize::{bits_required, MeasureStream, SerializeError, Stream},
};

/// One channel's contribution to a connection packet.
///
/// Defines the wire layout of the per-channel payload: either a run of
/// messages or a single block fragment.
pub(crate) struct ChannelPacketData<M> {
    pub(crate) channel_index: usize,
    pub(crate) content: PacketContent<M>,
    /// Set on read when a message body fails to deserialize. The packet
    /// itself stays "readable" so the failure lands on the one channel
    /// whose message broke, as `FailedToSerialize`, not on the whole
    /// connection.
    pub(crate) message_failed_to_serialize: bool,
}

pub(crate) enum PacketContent<M> {
    /// `(id, message)` pairs. Ids are message ids on reliable channels;
    /// unreliable channels ignore them on send and stamp the packet
    /// sequence on receive.
    Messages(Vec<(u16, M)>),
    /// A single fragment of a block in flight on a reliable channel.
    Fragment(FragmentData<M>),
}

pub(crate) struct FragmentData<M> {
    pub(crate) message_id: u16,
    pub(crate) num_fragments: usize,
    pub(crate) fragment_id: usize,
    pub(crate) data: Vec<u8>,
    /// The block message rides along with fragment zero so the receiver
    /// can construct the right message type before the block completes.
    pub(crate) message: Option<M>,
}

impl<M: NetworkMessage> ChannelPacketData<M> {
    pub(crate) fn empty() -> ChannelPacketData<M> {
        ChannelPacketData {
            channel_index: 0,
            content: PacketContent::Messages(Vec::new()),
            message_failed_to_serialize: false,
        }
    }

    pub(crate) fn messages(channel_index: usize, messages: Vec<(u16, M)>) -> ChannelPacketData<M> {
        ChannelPacketData {
            channel_index,
            content: PacketContent::Messages(messages),
            message_failed_to_serialize: false,
        }
    }

    pub(crate) fn fragment(channel_index: usize, fragment: FragmentData<M>) -> ChannelPacketData<M> {
        ChannelPacketData {
            channel_index,
            content: PacketContent::Fragment(fragment),
            message_failed_to_serialize: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match &self.content {
            PacketContent::Messages(messages) => messages.is_empty(),
            PacketContent::Fragment(_) => false,
        }
    }

    pub(crate) fn serialize<S, F>(
        &mut self,
        stream: &mut S,
        factory: &F,
        config: &ConnectionConfig,
    ) -> Result<(), SerializeError>
    where
        S: Stream,
        F: MessageFactory<Message = M>,
    {
        if config.num_channels > 1 {
            let mut channel_index = self.channel_index as i32;
            stream.serialize_int(&mut channel_index, 0, config.num_channels as i32 - 1)?;
            if S::IS_READING {
                self.channel_index = channel_index as usize;
            }
        } else if S::IS_READING {
            self.channel_index = 0;
        }
        let channel_config = &config.channels[self.channel_index];

        let mut block = matches!(self.content, PacketContent::Fragment(_));
        stream.serialize_bool(&mut block)?;

        if !block {
            match channel_config.kind {
                ChannelType::ReliableOrdered => {
                    self.serialize_ordered_messages(stream, factory, channel_config)
                }
                ChannelType::UnreliableUnordered => {
                    self.serialize_unordered_messages(stream, factory, channel_config)
                }
            }
        } else {
            if channel_config.disable_blocks {
                return Err(SerializeError::BlocksDisabled);
            }
            self.serialize_block_fragment(stream, factory, channel_config)
        }
    }

    /// Messages of a reliable-ordered channel: a count, the first id in
    /// full, the rest sequence-relative, then type + body per message.
    fn serialize_ordered_messages<S, F>(
        &mut self,
        stream: &mut S,
        factory: &F,
        channel_config: &ChannelConfig,
    ) -> Result<(), SerializeError>
    where
        S: Stream,
        F: MessageFactory<Message = M>,
    {
        let messages = match &mut self.content {
            PacketContent::Messages(messages) => messages,
            PacketContent::Fragment(_) => unreachable!("caller matched on the block flag"),
        };

        debug_assert!(S::IS_READING || !messages.is_empty());
        let mut num_messages = messages.len() as i32;
        stream.serialize_int(&mut num_messages, 1, channel_config.max_messages_per_packet as i32)?;
        let num_messages = num_messages as usize;

        let mut message_ids = vec![0u16; num_messages];
        if S::IS_WRITING {
            for (i, (id, _)) in messages.iter().enumerate() {
                message_ids[i] = *id;
            }
        }

        stream.serialize_u16(&mut message_ids[0])?;
        for i in 1..num_messages {
            let previous = message_ids[i - 1];
            let mut current = message_ids[i];
            stream.serialize_sequence_relative(previous, &mut current)?;
            message_ids[i] = current;
        }

        let type_bits = bits_required(0, factory.num_types() as i32 - 1);
        if S::IS_READING {
            messages.reserve(num_messages);
            for &message_id in &message_ids {
                match read_message_with_type(stream, factory, type_bits) {
                    Ok(message) => messages.push((message_id, message)),
                    Err(error) => {
                        log::error!("failed to deserialize message: {error}");
                        self.message_failed_to_serialize = true;
                        return Ok(());
                    }
                }
            }
        } else {
            for (_, message) in messages.iter_mut() {
                write_message_with_type(stream, message, type_bits)?;
            }
        }
        Ok(())
    }

    /// Messages of an unreliable-unordered channel: a count, then type +
    /// body per message, with block bytes inline for block messages.
    fn serialize_unordered_messages<S, F>(
        &mut self,
        stream: &mut S,
        factory: &F,
        channel_config: &ChannelConfig,
    ) -> Result<(), SerializeError>
    where
        S: Stream,
        F: MessageFactory<Message = M>,
    {
        let messages = match &mut self.content {
            PacketContent::Messages(messages) => messages,
            PacketContent::Fragment(_) => unreachable!("caller matched on the block flag"),
        };

        debug_assert!(S::IS_READING || !messages.is_empty());
        let mut num_messages = messages.len() as i32;
        stream.serialize_int(&mut num_messages, 1, channel_config.max_messages_per_packet as i32)?;
        let num_messages = num_messages as usize;

        let type_bits = bits_required(0, factory.num_types() as i32 - 1);
        if S::IS_READING {
            messages.reserve(num_messages);
            for _ in 0..num_messages {
                match read_unordered_message(stream, factory, type_bits, channel_config) {
                    Ok(message) => messages.push((0, message)),
                    Err(error) => {
                        log::error!("failed to deserialize message: {error}");
                        self.message_failed_to_serialize = true;
                        return Ok(());
                    }
                }
            }
        } else {
            for (_, message) in messages.iter_mut() {
                write_unordered_message(stream, message, type_bits, channel_config)?;
            }
        }
        Ok(())
    }

    fn serialize_block_fragment<S, F>(
        &mut self,
        stream: &mut S,
        factory: &F,
        channel_config: &ChannelConfig,
    ) -> Result<(), SerializeError>
    where
        S: Stream,
        F: MessageFactory<Message = M>,
    {
        if S::IS_READING {
            self.content = PacketContent::Fragment(FragmentData {
                message_id: 0,
                num_fragments: 1,
                fragment_id: 0,
                data: Vec::new(),
                message: None,
            });
        }
        let fragment = match &mut self.content {
            PacketContent::Fragment(fragment) => fragment,
            PacketContent::Messages(_) => unreachable!("caller matched on the block flag"),
        };

        stream.serialize_u16(&mut fragment.message_id)?;

        let max_fragments = channel_config.max_fragments_per_block();
        if max_fragments > 1 {
            let mut num_fragments = fragment.num_fragments as i32;
            stream.serialize_int(&mut num_fragments, 1, max_fragments as i32)?;
            if S::IS_READING {
                fragment.num_fragments = num_fragments as usize;
            }
        } else if S::IS_READING {
            fragment.num_fragments = 1;
        }

        if fragment.num_fragments > 1 {
            let mut fragment_id = fragment.fragment_id as i32;
            stream.serialize_int(&mut fragment_id, 0, fragment.num_fragments as i32 - 1)?;
            if S::IS_READING {
                fragment.fragment_id = fragment_id as usize;
            }
        } else if S::IS_READING {
            fragment.fragment_id = 0;
        }

        let mut fragment_size = fragment.data.len() as i32;
        stream.serialize_int(&mut fragment_size, 1, channel_config.block_fragment_size as i32)?;
        if S::IS_READING {
            fragment.data = vec![0u8; fragment_size as usize];
        }
        stream.serialize_bytes(&mut fragment.data)?;

        if fragment.fragment_id == 0 {
            let type_bits = bits_required(0, factory.num_types() as i32 - 1);
            if S::IS_READING {
                match read_message_with_type(stream, factory, type_bits) {
                    Ok(message) => fragment.message = Some(message),
                    Err(error) => {
                        log::error!("failed to deserialize block message: {error}");
                        self.message_failed_to_serialize = true;
                        return Ok(());
                    }
                }
            } else {
                let message = fragment
                    .message
                    .as_mut()
                    .expect("fragment zero carries its block message");
                write_message_with_type(stream, message, type_bits)?;
            }
        }
        Ok(())
    }
}

fn read_unordered_message<S, F>(
    stream: &mut S,
    factory: &F,
    type_bits: usize,
    channel_config: &ChannelConfig,
) -> Result<F::Message, SerializeError>
where
    S: Stream,
    F: MessageFactory,
{
    let mut message = read_message_with_type(stream, factory, type_bits)?;
    if message.is_block() {
        let mut block_size = 0;
        stream.serialize_int(&mut block_size, 1, channel_config.max_block_size as i32)?;
        let mut data = vec![0u8; block_size as usize];
        stream.serialize_bytes(&mut data)?;
        message.attach_block(data);
    }
    Ok(message)
}

fn read_message_with_type<S, F>(
    stream: &mut S,
    factory: &F,
    type_bits: usize,
) -> Result<F::Message, SerializeError>
where
    S: Stream,
    F: MessageFactory,
{
    let mut type_index = 0u32;
    if type_bits > 0 {
        stream.serialize_bits(&mut type_index, type_bits)?;
    }
    let mut message = factory
        .create_message(type_index as usize)
        .ok_or(SerializeError::UnknownMessageType)?;
    message.serialize(stream)?;
    Ok(message)
}

fn write_message_with_type<S, M>(
    stream: &mut S,
    message: &mut M,
    type_bits: usize,
) -> Result<(), SerializeError>
where
    S: Stream,
    M: NetworkMessage,
{
    debug_assert!(S::IS_WRITING);
    if type_bits > 0 {
        let mut type_index = message.type_index() as u32;
        debug_assert!(type_index < (1 << type_bits));
        stream.serialize_bits(&mut type_index, type_bits)?;
    }
    message.serialize(stream)
}

/// Write or measure one unreliable message: type, body, and the block
/// bytes inline when the message carries one.
///
/// The unreliable channel budgets with this exact routine against a
/// measure stream, so measured and written sizes cannot drift apart.
pub(crate) fn write_unordered_message<S, M>(
    stream: &mut S,
    message: &mut M,
    type_bits: usize,
    channel_config: &ChannelConfig,
) -> Result<(), SerializeError>
where
    S: Stream,
    M: NetworkMessage,
{
    write_message_with_type(stream, message, type_bits)?;
    if message.is_block() {
        debug_assert!(!message.block().is_empty());
        debug_assert!(message.block().len() <= channel_config.max_block_size);
        let mut block_size = message.block().len() as i32;
        stream.serialize_int(&mut block_size, 1, channel_config.max_block_size as i32)?;
        let mut data = message.block().to_vec();
        stream.serialize_bytes(&mut data)?;
    }
    Ok(())
}

/// Bits one unreliable message occupies on the wire, measured with the
/// same routine that writes it.
pub(crate) fn measure_unordered_message<M: NetworkMessage>(
    message: &mut M,
    type_bits: usize,
    channel_config: &ChannelConfig,
) -> usize {
    let mut stream = MeasureStream::new();
    write_unordered_message(&mut stream, message, type_bits, channel_config)
        .expect("measure streams cannot fail");
    stream.bits_processed()
}

/// Bits a message body occupies on the wire, excluding type and id.
pub(crate) fn measure_message_body<M: NetworkMessage>(message: &mut M) -> usize {
    let mut stream = MeasureStream::new();
    message
        .serialize(&mut stream)
        .expect("measure streams cannot fail");
    stream.bits_processed()
}
