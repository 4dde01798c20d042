use crate::channel::ChannelErrorLevel;

use super::channel_packet_data::ChannelPacketData;

/// The per-kind channel state machine behind the `Channel` wrapper.
///
/// Implementations own their `ChannelConfig` copy. Errors surface as
/// returned `ChannelErrorLevel`s; the wrapper latches them.
pub(crate) trait Processor<M> {
    fn reset(&mut self);

    fn advance_time(&mut self, new_time: f64);

    fn can_send_message(&self) -> bool;

    fn has_messages_to_send(&self) -> bool;

    fn send_message(&mut self, message: M);

    /// Pop the next received message, paired with its delivery id.
    fn receive_message(&mut self) -> Option<(u16, M)>;

    /// Emit payload for the packet with sequence `packet_sequence`, staying
    /// within `available_bits`. `message_type_bits` is the wire cost of one
    /// message type tag.
    fn packet_data(
        &mut self,
        channel_index: usize,
        packet_sequence: u16,
        available_bits: usize,
        message_type_bits: usize,
    ) -> (ChannelPacketData<M>, usize);

    fn process_packet_data(
        &mut self,
        packet_data: ChannelPacketData<M>,
        packet_sequence: u16,
    ) -> Result<(), ChannelErrorLevel>;

    fn process_ack(&mut self, packet_sequence: u16);
}
