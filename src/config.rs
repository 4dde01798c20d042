pub const MAX_CHANNELS: usize = 64;

const DEFAULT_TIMEOUT: i32 = 5;

/// Determines the reliability and ordering guarantees for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    ReliableOrdered,
    UnreliableUnordered,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub kind: ChannelType,
    /// Disables blocks being sent across this channel.
    pub disable_blocks: bool,
    /// Number of packet entries in the sent packet sequence buffer
    /// (reliable channels only).
    pub sent_packet_buffer_size: usize,
    /// Number of messages in the send queue.
    pub message_send_queue_size: usize,
    /// Number of messages in the receive queue.
    pub message_receive_queue_size: usize,
    /// Maximum number of messages per packet.
    pub max_messages_per_packet: usize,
    /// Maximum bytes this channel may contribute to a packet. `None` means
    /// the channel may use all bytes remaining in the packet.
    pub packet_budget: Option<usize>,
    /// Maximum block size that can be sent across this channel (bytes).
    pub max_block_size: usize,
    /// Block fragment size, for blocks sent across reliable channels (bytes).
    pub block_fragment_size: usize,
    /// Time between message resends, in seconds (reliable channels only).
    pub message_resend_time: f64,
    /// Time between block fragment resends, in seconds (reliable channels
    /// only).
    pub block_fragment_resend_time: f64,
}

impl ChannelConfig {
    pub fn new(kind: ChannelType) -> Self {
        ChannelConfig {
            kind,
            disable_blocks: false,
            sent_packet_buffer_size: 1024,
            message_send_queue_size: 1024,
            message_receive_queue_size: 1024,
            max_messages_per_packet: 256,
            packet_budget: None,
            max_block_size: 256 * 1024,
            block_fragment_size: 1024,
            message_resend_time: 0.1,
            block_fragment_resend_time: 0.25,
        }
    }

    pub fn max_fragments_per_block(&self) -> usize {
        (self.max_block_size + self.block_fragment_size - 1) / self.block_fragment_size
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    /// Number of message channels, `1..=MAX_CHANNELS`.
    pub num_channels: usize,
    /// Maximum size of a connection packet handed to the transport (bytes).
    pub max_packet_size: usize,
    /// Per-channel configuration, indexed by channel.
    pub channels: [ChannelConfig; MAX_CHANNELS],
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            num_channels: 1,
            max_packet_size: 8 * 1024,
            channels: [ChannelConfig::new(ChannelType::ReliableOrdered); MAX_CHANNELS],
        }
    }
}

/// Connection configuration plus the knobs the surrounding client/server
/// stack consumes. The values outside `connection` are forwarded to the
/// transport and endpoint layers below; the connection itself never reads
/// them.
#[derive(Clone)]
pub struct ClientServerConfig {
    pub connection: ConnectionConfig,
    /// Clients can only connect to servers with the same protocol id. Use this for versioning.
    pub protocol_id: u64,
    /// Timeout value in seconds. Set to negative value to disable timeouts (for debugging only).
    pub timeout: i32,
    /// Memory allocated inside Client for packets, messages and stream allocations (bytes)
    pub client_memory: usize,
    /// Memory allocated inside Server for global connection request and challenge response packets (bytes)
    pub server_global_memory: usize,
    /// Memory allocated inside Server for packets, messages and stream allocations per-client (bytes)
    pub server_per_client_memory: usize,
    /// Packets above this size (bytes) are split apart into fragments and reassembled on the other side.
    pub fragment_packets_above: usize,
    /// Size of each packet fragment (bytes).
    pub packet_fragment_size: usize,
    /// Maximum number of fragments a packet can be split up into.
    pub max_packet_fragments: usize,
    /// Number of packet entries in the fragmentation reassembly buffer.
    pub packet_reassembly_buffer_size: usize,
    /// Number of packet entries in the acked packet buffer. Consider your packet send rate and aim to have at least a few seconds worth of entries.
    pub acked_packets_buffer_size: usize,
    /// Number of packet entries in the received packet sequence buffer. Consider your packet send rate and aim to have at least a few seconds worth of entries.
    pub received_packets_buffer_size: usize,
    /// Round-Trip Time (RTT) smoothing factor over time.
    pub rtt_smoothing_factor: f32,
}

impl ClientServerConfig {
    pub fn new(num_channels: usize) -> Self {
        assert!(num_channels >= 1 && num_channels <= MAX_CHANNELS);
        let mut config = ClientServerConfig::default();
        config.connection.num_channels = num_channels;
        config
    }
}

impl Default for ClientServerConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        let packet_fragment_size = 1024;
        let max_packet_fragments =
            (connection.max_packet_size + packet_fragment_size - 1) / packet_fragment_size;
        ClientServerConfig {
            connection,
            protocol_id: 0,
            timeout: DEFAULT_TIMEOUT,
            client_memory: 10 * 1024 * 1024,
            server_global_memory: 10 * 1024 * 1024,
            server_per_client_memory: 10 * 1024 * 1024,
            fragment_packets_above: 1024,
            packet_fragment_size,
            max_packet_fragments,
            packet_reassembly_buffer_size: 64,
            acked_packets_buffer_size: 256,
            received_packets_buffer_size: 256,
            rtt_smoothing_factor: 0.0025,
        }
    }
}
