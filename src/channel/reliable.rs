use std::cmp;

use crate::{
    channel::{ChannelErrorLevel, CONSERVATIVE_FRAGMENT_HEADER_BITS, CONSERVATIVE_MESSAGE_HEADER_BITS},
    config::{ChannelConfig, ChannelType},
    message::NetworkMessage,
    serialize::{MeasureStream, Stream},
};

use super::{
    bit_array::BitArray,
    channel_packet_data::{measure_message_body, FragmentData, PacketContent},
    processor::Processor,
    sequence_buffer::{sequence_greater_than, sequence_less_than, SequenceBuffer},
    ChannelPacketData,
};

/// Messages sent across this channel are guaranteed to arrive, in the
/// order they were sent. Blocks are split into fragments and resent until
/// every fragment is acked; at most one block is in flight per direction.
pub(crate) struct Reliable<M> {
    time: f64,
    config: ChannelConfig,

    /// Id of the next message to be added to the send queue.
    send_message_id: u16,
    /// Id of the next message to be delivered from the receive queue.
    receive_message_id: u16,
    /// Id of the oldest message not yet fully acked. The next message we
    /// need the peer to have; fragments only ever flow for this id.
    oldest_unacked_message_id: u16,

    /// Flat arena of message ids per sent packet; each `SentPacketEntry`
    /// references a run of this buffer.
    sent_packet_message_ids: Vec<u16>,

    sent_packets: SequenceBuffer<SentPacketEntry>,
    message_send_queue: SequenceBuffer<MessageSendQueueEntry<M>>,
    message_receive_queue: SequenceBuffer<MessageReceiveQueueEntry<M>>,

    send_block: SendBlockData,
    receive_block: ReceiveBlockData<M>,
}

impl<M: NetworkMessage> Reliable<M> {
    pub(crate) fn new(config: ChannelConfig, time: f64) -> Reliable<M> {
        debug_assert_eq!(config.kind, ChannelType::ReliableOrdered);

        let max_fragments = config.max_fragments_per_block();
        let block_scratch = if config.disable_blocks {
            0
        } else {
            max_fragments * config.block_fragment_size
        };

        Reliable {
            time,

            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,

            sent_packet_message_ids: vec![
                0u16;
                config.max_messages_per_packet * config.sent_packet_buffer_size
            ],

            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            message_send_queue: SequenceBuffer::new(config.message_send_queue_size),
            message_receive_queue: SequenceBuffer::new(config.message_receive_queue_size),

            send_block: SendBlockData::new(max_fragments),
            receive_block: ReceiveBlockData::new(max_fragments, block_scratch),

            config,
        }
    }

    /// True when the entry at the head of the send queue is a block
    /// message. Fragments only flow for the oldest unacked id, so the ack
    /// mapping stays trivial and the receiver needs one block buffer.
    fn sending_block_message(&self) -> bool {
        self.message_send_queue
            .get(self.oldest_unacked_message_id)
            .map(|entry| entry.block)
            .unwrap_or(false)
    }

    /// Find all messages in the send queue that should go into the packet.
    ///
    /// A message is included if it fits the remaining budget and its
    /// resend time has elapsed (or it has never been sent). Messages that
    /// do not fit are skipped, not requeued; the scan gives up after
    /// `message_send_queue_size` misses or when less than four bytes of
    /// budget remain, so a queue full of recently-sent messages does not
    /// cost a full scan per packet.
    ///
    /// The id of the first included message costs 16 bits; later ids cost
    /// their measured sequence-relative encoding.
    ///
    /// Assumes `has_messages_to_send`.
    fn messages_to_send(
        &mut self,
        mut available_bits: usize,
        message_type_bits: usize,
    ) -> (Vec<u16>, usize) {
        debug_assert!(self.has_messages_to_send());

        let mut message_ids = Vec::new();

        if let Some(budget) = self.config.packet_budget {
            available_bits = cmp::min(budget * 8, available_bits);
        }

        let give_up_bits = 4 * 8;
        let message_limit = cmp::min(
            self.message_send_queue.capacity(),
            self.message_receive_queue.capacity(),
        );

        let mut previous_message_id = 0u16;
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut give_up_counter = 0;

        for i in 0..message_limit {
            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }

            if give_up_counter > self.message_send_queue.capacity() {
                break;
            }

            let message_id = self.oldest_unacked_message_id.wrapping_add(i as u16);
            let time = self.time;
            let resend_time = self.config.message_resend_time;

            let Some(entry) = self.message_send_queue.get_mut(message_id) else {
                continue;
            };

            // a block waits until everything before it is acked
            if entry.block {
                break;
            }

            if entry.time_last_sent + resend_time <= time && available_bits >= entry.measured_bits {
                let mut message_bits = entry.measured_bits + message_type_bits;

                if message_ids.is_empty() {
                    message_bits += 16;
                } else {
                    let mut measure = MeasureStream::new();
                    let mut current = message_id;
                    measure
                        .serialize_sequence_relative(previous_message_id, &mut current)
                        .expect("measure streams cannot fail");
                    message_bits += measure.bits_processed();
                }

                if used_bits + message_bits > available_bits {
                    give_up_counter += 1;
                    continue;
                }

                used_bits += message_bits;
                message_ids.push(message_id);
                previous_message_id = message_id;
                entry.time_last_sent = time;
            }

            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        (message_ids, used_bits)
    }

    /// Build ChannelPacketData referencing every message in `message_ids`.
    fn message_packet_data(
        &self,
        channel_index: usize,
        message_ids: &[u16],
    ) -> ChannelPacketData<M> {
        let mut messages = Vec::with_capacity(message_ids.len());
        for &message_id in message_ids {
            let entry = self
                .message_send_queue
                .get(message_id)
                .expect("chosen ids stay in the send queue");
            messages.push((message_id, entry.message.clone()));
        }
        ChannelPacketData::messages(channel_index, messages)
    }

    /// Record which message ids went into the packet with this sequence.
    fn add_message_packet_entry(&mut self, message_ids: &[u16], packet_sequence: u16) {
        let start = (packet_sequence as usize % self.config.sent_packet_buffer_size)
            * self.config.max_messages_per_packet;
        let run = message_ids.len();
        let time_sent = self.time;

        let id_arena = &mut self.sent_packet_message_ids;
        self.sent_packets.insert_with(packet_sequence, || {
            for (i, id) in message_ids.iter().enumerate() {
                id_arena[start + i] = *id;
            }
            SentPacketEntry {
                acked: false,
                time_sent,
                message_ids: (start, run),
                fragment: None,
            }
        });
    }

    fn add_fragment_packet_entry(
        &mut self,
        message_id: u16,
        fragment_id: usize,
        packet_sequence: u16,
    ) {
        let time_sent = self.time;
        self.sent_packets.insert_with(packet_sequence, || SentPacketEntry {
            acked: false,
            time_sent,
            message_ids: (0, 0),
            fragment: Some((message_id, fragment_id)),
        });
    }

    /// Pick the next fragment of the in-flight block to (re)send.
    ///
    /// Starts the block on first call. Returns the fragment payload and
    /// its conservative bit cost, or None when every unacked fragment was
    /// sent too recently.
    fn next_fragment_to_send(
        &mut self,
        message_type_bits: usize,
    ) -> Option<(FragmentData<M>, usize)> {
        let message_id = self.oldest_unacked_message_id;

        let (block_size, measured_bits) = {
            let entry = self
                .message_send_queue
                .get(message_id)
                .expect("sending_block_message found this entry");
            debug_assert!(entry.block);
            (entry.message.block().len(), entry.measured_bits)
        };

        if !self.send_block.active {
            let num_fragments =
                (block_size + self.config.block_fragment_size - 1) / self.config.block_fragment_size;
            debug_assert!(num_fragments >= 1);
            debug_assert!(num_fragments <= self.config.max_fragments_per_block());
            self.send_block.begin(message_id, block_size, num_fragments);
        }
        debug_assert_eq!(self.send_block.block_message_id, message_id);
        debug_assert_eq!(self.send_block.block_size, block_size);

        let num_fragments = self.send_block.num_fragments;
        let fragment_id = (0..num_fragments).find(|&i| {
            !self.send_block.acked_fragment.get(i)
                && self.send_block.fragment_send_time[i] + self.config.block_fragment_resend_time
                    <= self.time
        })?;

        let start = fragment_id * self.config.block_fragment_size;
        let end = cmp::min(start + self.config.block_fragment_size, block_size);

        let entry = self
            .message_send_queue
            .get(message_id)
            .expect("looked up above");
        let data = entry.message.block()[start..end].to_vec();
        let message = (fragment_id == 0).then(|| entry.message.clone());

        self.send_block.fragment_send_time[fragment_id] = self.time;

        let mut fragment_bits = CONSERVATIVE_FRAGMENT_HEADER_BITS + (end - start) * 8;
        if fragment_id == 0 {
            fragment_bits += measured_bits + message_type_bits;
        }

        Some((
            FragmentData {
                message_id,
                num_fragments,
                fragment_id,
                data,
                message,
            },
            fragment_bits,
        ))
    }

    /// Advance `oldest_unacked_message_id` past acked (removed) entries,
    /// stopping at the next live entry or at the send head.
    fn update_oldest_unacked_message_id(&mut self) {
        let stop_message_id = self.message_send_queue.sequence_pointer();
        loop {
            if self.oldest_unacked_message_id == stop_message_id
                || self.message_send_queue.exists(self.oldest_unacked_message_id)
            {
                break;
            }
            self.oldest_unacked_message_id = self.oldest_unacked_message_id.wrapping_add(1);
        }
        debug_assert!(!sequence_greater_than(
            self.oldest_unacked_message_id,
            stop_message_id
        ));
    }

    fn process_packet_messages(
        &mut self,
        messages: Vec<(u16, M)>,
    ) -> Result<(), ChannelErrorLevel> {
        let min_message_id = self.receive_message_id;
        let max_message_id =
            min_message_id.wrapping_add(self.message_receive_queue.capacity() as u16 - 1);

        for (message_id, message) in messages {
            if sequence_less_than(message_id, min_message_id) {
                // already delivered; the resend crossed the ack in flight
                continue;
            }

            if sequence_greater_than(message_id, max_message_id) {
                // the receiver is not draining its receive queue
                return Err(ChannelErrorLevel::Desync);
            }

            if self.message_receive_queue.exists(message_id) {
                continue;
            }

            let inserted = self
                .message_receive_queue
                .insert_with(message_id, || MessageReceiveQueueEntry {
                    message_id,
                    message,
                });
            debug_assert!(inserted, "in-window ids always insert");
        }

        Ok(())
    }

    fn process_packet_fragment(
        &mut self,
        fragment: FragmentData<M>,
    ) -> Result<(), ChannelErrorLevel> {
        debug_assert!(!self.config.disable_blocks);

        // fragments are only accepted for the block due next in sequence
        let expected_message_id = self.message_receive_queue.sequence_pointer();
        if fragment.message_id != expected_message_id {
            return Ok(());
        }

        if !self.receive_block.active {
            let max_fragments = self.config.max_fragments_per_block();
            if fragment.num_fragments == 0 || fragment.num_fragments > max_fragments {
                return Err(ChannelErrorLevel::Desync);
            }
            self.receive_block
                .begin(fragment.message_id, fragment.num_fragments);
        }

        if fragment.num_fragments != self.receive_block.num_fragments
            || fragment.fragment_id >= self.receive_block.num_fragments
        {
            return Err(ChannelErrorLevel::Desync);
        }

        if self.receive_block.received_fragment.get(fragment.fragment_id) {
            return Ok(());
        }

        self.receive_block.received_fragment.set(fragment.fragment_id);

        let offset = fragment.fragment_id * self.config.block_fragment_size;
        self.receive_block.block_data[offset..offset + fragment.data.len()]
            .copy_from_slice(&fragment.data);

        if fragment.fragment_id == self.receive_block.num_fragments - 1 {
            self.receive_block.block_size = (self.receive_block.num_fragments - 1)
                * self.config.block_fragment_size
                + fragment.data.len();
            if self.receive_block.block_size > self.config.max_block_size {
                return Err(ChannelErrorLevel::Desync);
            }
        }

        if fragment.fragment_id == 0 {
            self.receive_block.block_message = fragment.message;
        }

        self.receive_block.num_received_fragments += 1;

        if self.receive_block.num_received_fragments == self.receive_block.num_fragments {
            // finished receiving the block
            let block_size = self.receive_block.block_size;
            let message_id = self.receive_block.message_id;
            let Some(mut message) = self.receive_block.block_message.take() else {
                return Err(ChannelErrorLevel::Desync);
            };
            message.attach_block(self.receive_block.block_data[..block_size].to_vec());
            self.receive_block.reset();

            // a stalled receiver's queue slot may still hold an
            // undelivered message; evicting it would break ordering
            if !self.message_receive_queue.available(message_id) {
                return Err(ChannelErrorLevel::Desync);
            }
            let inserted = self
                .message_receive_queue
                .insert_with(message_id, || MessageReceiveQueueEntry {
                    message_id,
                    message,
                });
            if !inserted {
                return Err(ChannelErrorLevel::Desync);
            }
        }

        Ok(())
    }
}

impl<M: NetworkMessage> Processor<M> for Reliable<M> {
    fn reset(&mut self) {
        self.send_message_id = 0;
        self.receive_message_id = 0;
        self.oldest_unacked_message_id = 0;

        self.sent_packets.reset();
        self.message_send_queue.reset();
        self.message_receive_queue.reset();

        self.send_block.reset();
        self.receive_block.reset();
    }

    fn advance_time(&mut self, new_time: f64) {
        self.time = new_time;
    }

    /// New messages can be sent while there is space at the send head.
    fn can_send_message(&self) -> bool {
        self.message_send_queue.available(self.send_message_id)
    }

    /// There are messages to send while any id is awaiting an ack.
    fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_message_id != self.send_message_id
    }

    fn send_message(&mut self, message: M) {
        debug_assert!(self.can_send_message());

        let mut message = message;
        let message_id = self.send_message_id;
        let block = message.is_block();
        if block {
            debug_assert!(!message.block().is_empty());
            debug_assert!(message.block().len() <= self.config.max_block_size);
        }

        let measured_bits = measure_message_body(&mut message);

        let inserted = self
            .message_send_queue
            .insert_with(message_id, || MessageSendQueueEntry {
                message_id,
                message,
                time_last_sent: -1.0,
                measured_bits,
                block,
            });
        debug_assert!(inserted, "can_send_message checked this slot");

        self.send_message_id = self.send_message_id.wrapping_add(1);
    }

    fn receive_message(&mut self) -> Option<(u16, M)> {
        let entry = self.message_receive_queue.take(self.receive_message_id)?;
        debug_assert_eq!(entry.message_id, self.receive_message_id);

        self.receive_message_id = self.receive_message_id.wrapping_add(1);

        Some((entry.message_id, entry.message))
    }

    fn packet_data(
        &mut self,
        channel_index: usize,
        packet_sequence: u16,
        available_bits: usize,
        message_type_bits: usize,
    ) -> (ChannelPacketData<M>, usize) {
        if !self.has_messages_to_send() {
            return (ChannelPacketData::empty(), 0);
        }

        if self.sending_block_message() {
            let available_bits = match self.config.packet_budget {
                Some(budget) => cmp::min(budget * 8, available_bits),
                None => available_bits,
            };

            // a packet without room for a whole fragment carries nothing
            if self.config.block_fragment_size * 8 + CONSERVATIVE_FRAGMENT_HEADER_BITS
                > available_bits
            {
                return (ChannelPacketData::empty(), 0);
            }

            if let Some((fragment, fragment_bits)) = self.next_fragment_to_send(message_type_bits) {
                self.add_fragment_packet_entry(
                    fragment.message_id,
                    fragment.fragment_id,
                    packet_sequence,
                );
                return (
                    ChannelPacketData::fragment(channel_index, fragment),
                    fragment_bits,
                );
            }
        } else {
            let (message_ids, message_bits) =
                self.messages_to_send(available_bits, message_type_bits);

            if !message_ids.is_empty() {
                let packet_data = self.message_packet_data(channel_index, &message_ids);
                self.add_message_packet_entry(&message_ids, packet_sequence);
                return (packet_data, message_bits);
            }
        }

        (ChannelPacketData::empty(), 0)
    }

    fn process_packet_data(
        &mut self,
        packet_data: ChannelPacketData<M>,
        _packet_sequence: u16,
    ) -> Result<(), ChannelErrorLevel> {
        match packet_data.content {
            PacketContent::Messages(messages) => self.process_packet_messages(messages),
            PacketContent::Fragment(fragment) => self.process_packet_fragment(fragment),
        }
    }

    fn process_ack(&mut self, ack: u16) {
        let Some(entry) = self.sent_packets.get_mut(ack) else {
            return;
        };
        if entry.acked {
            return;
        }
        entry.acked = true;

        let (start, run) = entry.message_ids;
        let fragment = entry.fragment;

        let mut advance = false;

        // remove every message this packet carried from the send queue
        for i in 0..run {
            let message_id = self.sent_packet_message_ids[start + i];
            if self.message_send_queue.take(message_id).is_some() {
                advance = true;
            }
        }

        if let Some((block_message_id, fragment_id)) = fragment {
            if self.send_block.active
                && self.send_block.block_message_id == block_message_id
                && !self.send_block.acked_fragment.get(fragment_id)
            {
                self.send_block.acked_fragment.set(fragment_id);
                self.send_block.num_acked_fragments += 1;

                if self.send_block.num_acked_fragments == self.send_block.num_fragments {
                    self.send_block.reset();
                    if self.message_send_queue.take(block_message_id).is_some() {
                        advance = true;
                    }
                }
            }
        }

        if advance {
            self.update_oldest_unacked_message_id();
        }
    }
}

struct MessageSendQueueEntry<M> {
    message_id: u16,
    message: M,
    time_last_sent: f64,
    measured_bits: usize,
    block: bool,
}

struct MessageReceiveQueueEntry<M> {
    message_id: u16,
    message: M,
}

struct SentPacketEntry {
    /// The time the packet was sent. Used to estimate round trip time.
    #[allow(dead_code)]
    time_sent: f64,
    /// References `sent_packet_message_ids`, as (start index, run length).
    message_ids: (usize, usize),
    /// `(block message id, fragment id)` when this packet carried a
    /// fragment instead of messages.
    fragment: Option<(u16, usize)>,
    /// True once this packet has been acked; repeat acks are ignored.
    acked: bool,
}

/// Per-direction state for the one block allowed in flight.
struct SendBlockData {
    active: bool,
    block_message_id: u16,
    block_size: usize,
    num_fragments: usize,
    num_acked_fragments: usize,
    acked_fragment: BitArray,
    fragment_send_time: Vec<f64>,
}

impl SendBlockData {
    fn new(max_fragments: usize) -> SendBlockData {
        SendBlockData {
            active: false,
            block_message_id: 0,
            block_size: 0,
            num_fragments: 0,
            num_acked_fragments: 0,
            acked_fragment: BitArray::new(max_fragments),
            fragment_send_time: vec![0.0; max_fragments],
        }
    }

    fn begin(&mut self, message_id: u16, block_size: usize, num_fragments: usize) {
        debug_assert!(!self.active);
        self.active = true;
        self.block_message_id = message_id;
        self.block_size = block_size;
        self.num_fragments = num_fragments;
        self.num_acked_fragments = 0;
        self.acked_fragment.clear_all();
        for send_time in &mut self.fragment_send_time {
            *send_time = -1.0;
        }
    }

    fn reset(&mut self) {
        self.active = false;
    }
}

struct ReceiveBlockData<M> {
    active: bool,
    num_fragments: usize,
    num_received_fragments: usize,
    message_id: u16,
    block_size: usize,
    received_fragment: BitArray,
    /// Reassembly scratch, one fragment-aligned slot per possible fragment.
    block_data: Vec<u8>,
    block_message: Option<M>,
}

impl<M> ReceiveBlockData<M> {
    fn new(max_fragments: usize, scratch_bytes: usize) -> ReceiveBlockData<M> {
        ReceiveBlockData {
            active: false,
            num_fragments: 0,
            num_received_fragments: 0,
            message_id: 0,
            block_size: 0,
            received_fragment: BitArray::new(max_fragments),
            block_data: vec![0u8; scratch_bytes],
            block_message: None,
        }
    }

    fn begin(&mut self, message_id: u16, num_fragments: usize) {
        debug_assert!(!self.active);
        self.active = true;
        self.num_fragments = num_fragments;
        self.num_received_fragments = 0;
        self.message_id = message_id;
        self.block_size = 0;
        self.received_fragment.clear_all();
        self.block_message = None;
    }

    fn reset(&mut self) {
        self.active = false;
        self.block_message = None;
    }
}
