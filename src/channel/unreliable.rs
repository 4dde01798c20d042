use std::{cmp, collections::VecDeque};

use crate::{
    channel::{ChannelErrorLevel, CONSERVATIVE_MESSAGE_HEADER_BITS},
    config::{ChannelConfig, ChannelType},
    message::NetworkMessage,
};

use super::{
    channel_packet_data::{measure_unordered_message, PacketContent},
    processor::Processor,
    ChannelPacketData,
};

/// Messages sent across this channel are not guaranteed to arrive, and may
/// come in a different order than they were sent. Best for time critical
/// data like snapshots and object state.
///
/// Delivery is fire-and-forget: a message popped for a packet that does
/// not fit the remaining budget is discarded, not requeued. Blocks are
/// serialized inline with the message rather than fragmented, so
/// `max_block_size` must leave a block plus overhead within one packet
/// budget.
pub(crate) struct Unreliable<M> {
    config: ChannelConfig,
    message_send_queue: VecDeque<M>,
    message_receive_queue: VecDeque<(u16, M)>,
}

impl<M> Unreliable<M> {
    pub(crate) fn new(config: ChannelConfig) -> Unreliable<M> {
        debug_assert_eq!(config.kind, ChannelType::UnreliableUnordered);

        Unreliable {
            message_send_queue: VecDeque::with_capacity(config.message_send_queue_size),
            message_receive_queue: VecDeque::with_capacity(config.message_receive_queue_size),
            config,
        }
    }
}

impl<M: NetworkMessage> Processor<M> for Unreliable<M> {
    fn reset(&mut self) {
        self.message_send_queue.clear();
        self.message_receive_queue.clear();
    }

    fn advance_time(&mut self, _new_time: f64) {
        /* no-op for unreliable channels */
    }

    fn can_send_message(&self) -> bool {
        self.message_send_queue.len() < self.config.message_send_queue_size
    }

    fn has_messages_to_send(&self) -> bool {
        !self.message_send_queue.is_empty()
    }

    fn send_message(&mut self, message: M) {
        debug_assert!(self.can_send_message());
        self.message_send_queue.push_back(message);
    }

    fn receive_message(&mut self) -> Option<(u16, M)> {
        self.message_receive_queue.pop_front()
    }

    fn packet_data(
        &mut self,
        channel_index: usize,
        _packet_sequence: u16,
        mut available_bits: usize,
        message_type_bits: usize,
    ) -> (ChannelPacketData<M>, usize) {
        if self.message_send_queue.is_empty() {
            return (ChannelPacketData::empty(), 0);
        }

        if let Some(packet_budget) = self.config.packet_budget {
            if packet_budget == 0 {
                log::warn!("packet budget is 0, so no messages can be written to this channel");
            }
            available_bits = cmp::min(packet_budget * 8, available_bits);
        }

        let give_up_bits = 4 * 8;
        let mut used_bits = CONSERVATIVE_MESSAGE_HEADER_BITS;
        let mut messages = Vec::new();

        loop {
            if self.message_send_queue.is_empty() {
                break;
            }

            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }

            if messages.len() == self.config.max_messages_per_packet {
                break;
            }

            let mut message = match self.message_send_queue.pop_front() {
                Some(message) => message,
                None => break,
            };

            let message_bits = measure_unordered_message(&mut message, message_type_bits, &self.config);

            if used_bits + message_bits > available_bits {
                // over budget: dropped, not requeued. delivery here is
                // never guaranteed, and requeueing would head-of-line
                // block every later message behind one that cannot fit.
                continue;
            }

            used_bits += message_bits;
            messages.push((0, message));
        }

        if messages.is_empty() {
            return (ChannelPacketData::empty(), 0);
        }

        (ChannelPacketData::messages(channel_index, messages), used_bits)
    }

    fn process_packet_data(
        &mut self,
        packet_data: ChannelPacketData<M>,
        packet_sequence: u16,
    ) -> Result<(), ChannelErrorLevel> {
        let messages = match packet_data.content {
            PacketContent::Messages(messages) => messages,
            // unreliable channels never emit fragments, so receiving one
            // means the peer is running a mismatched channel config
            PacketContent::Fragment(_) => return Err(ChannelErrorLevel::Desync),
        };

        for (_, message) in messages {
            if self.message_receive_queue.len() < self.config.message_receive_queue_size {
                // delivery ids are the sequence of the packet that carried
                // the message
                self.message_receive_queue.push_back((packet_sequence, message));
            }
        }
        Ok(())
    }

    fn process_ack(&mut self, _packet_sequence: u16) {
        /* no-op for unreliable channels */
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serialize::{SerializeError, Stream};

    #[derive(Debug, Clone, PartialEq)]
    enum TestMessage {
        Value(u32),
        Blob(Vec<u8>),
    }

    impl TestMessage {
        fn value(value: u32) -> TestMessage {
            TestMessage::Value(value)
        }
    }

    impl NetworkMessage for TestMessage {
        fn type_index(&self) -> usize {
            match self {
                TestMessage::Value(_) => 0,
                TestMessage::Blob(_) => 1,
            }
        }

        fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), SerializeError> {
            if let TestMessage::Value(value) = self {
                stream.serialize_bits(value, 32)?;
            }
            Ok(())
        }

        fn is_block(&self) -> bool {
            matches!(self, TestMessage::Blob(_))
        }

        fn block(&self) -> &[u8] {
            match self {
                TestMessage::Blob(data) => data,
                TestMessage::Value(_) => &[],
            }
        }

        fn attach_block(&mut self, data: Vec<u8>) {
            *self = TestMessage::Blob(data);
        }
    }

    fn config() -> ChannelConfig {
        let mut config = ChannelConfig::new(ChannelType::UnreliableUnordered);
        config.message_send_queue_size = 8;
        config.message_receive_queue_size = 8;
        config.max_messages_per_packet = 8;
        config
    }

    #[test]
    fn fifo_send_and_receive() {
        let mut channel: Unreliable<TestMessage> = Unreliable::new(config());

        for i in 0..3 {
            assert!(channel.can_send_message());
            channel.send_message(TestMessage::value(i));
        }

        let (packet_data, bits) = channel.packet_data(0, 11, usize::MAX, 0);
        assert!(bits > 0);
        assert!(!channel.has_messages_to_send());

        let mut receiver: Unreliable<TestMessage> = Unreliable::new(config());
        receiver.process_packet_data(packet_data, 11).unwrap();

        for i in 0..3 {
            let (id, message) = receiver.receive_message().unwrap();
            assert_eq!(id, 11);
            assert_eq!(message, TestMessage::value(i));
        }
        assert!(receiver.receive_message().is_none());
    }

    #[test]
    fn send_queue_bounded() {
        let mut channel: Unreliable<TestMessage> = Unreliable::new(config());
        for i in 0..8 {
            assert!(channel.can_send_message());
            channel.send_message(TestMessage::value(i));
        }
        assert!(!channel.can_send_message());
    }

    #[test]
    fn over_budget_messages_are_discarded() {
        let mut config = config();
        config.max_block_size = 1024;
        let mut channel: Unreliable<TestMessage> = Unreliable::new(config);

        channel.send_message(TestMessage::Blob(vec![1u8; 512]));
        channel.send_message(TestMessage::value(1));

        // the block message cannot fit 300 bits; the value message can
        let (packet_data, bits) = channel.packet_data(0, 0, 300, 0);
        assert!(bits > 0);
        match packet_data.content {
            PacketContent::Messages(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].1, TestMessage::value(1));
            }
            PacketContent::Fragment(_) => panic!("expected messages"),
        }

        // the popped block was dropped, not requeued
        assert!(!channel.has_messages_to_send());
        let (_, bits) = channel.packet_data(0, 1, usize::MAX, 0);
        assert_eq!(bits, 0);
    }

    #[test]
    fn full_receive_queue_drops_messages() {
        let mut receiver: Unreliable<TestMessage> = Unreliable::new(config());

        let messages: Vec<(u16, TestMessage)> =
            (0..12).map(|i| (0, TestMessage::value(i))).collect();
        let packet_data = ChannelPacketData::messages(0, messages);
        receiver.process_packet_data(packet_data, 5).unwrap();

        let mut received = 0;
        while receiver.receive_message().is_some() {
            received += 1;
        }
        assert_eq!(received, 8);
    }

    #[test]
    fn inline_block_measured_within_budget() {
        let mut config = config();
        config.max_block_size = 1024;
        let mut channel: Unreliable<TestMessage> = Unreliable::new(config);

        channel.send_message(TestMessage::Blob(vec![0x5a; 512]));

        // measured cost covers type, size field, alignment and bytes
        let (packet_data, bits) = channel.packet_data(0, 0, usize::MAX, 4);
        assert!(bits >= 512 * 8 + 32);
        match packet_data.content {
            PacketContent::Messages(messages) => {
                assert_eq!(messages[0].1, TestMessage::Blob(vec![0x5a; 512]));
            }
            PacketContent::Fragment(_) => panic!("expected messages"),
        }
    }
}
