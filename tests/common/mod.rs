use netchan::{
    connection::Connection,
    message::{MessageFactory, NetworkMessage},
    serialize::{SerializeError, Stream},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const MAX_TEST_PACKET_BYTES: usize = 16 * 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestMessage {
    Sequence(u16),
    Value(u64),
    Block(Vec<u8>),
}

impl NetworkMessage for TestMessage {
    fn type_index(&self) -> usize {
        match self {
            TestMessage::Sequence(_) => 0,
            TestMessage::Value(_) => 1,
            TestMessage::Block(_) => 2,
        }
    }

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), SerializeError> {
        match self {
            TestMessage::Sequence(sequence) => stream.serialize_u16(sequence),
            TestMessage::Value(value) => stream.serialize_u64(value),
            // the payload travels as a block, nothing in the body
            TestMessage::Block(_) => Ok(()),
        }
    }

    fn is_block(&self) -> bool {
        matches!(self, TestMessage::Block(_))
    }

    fn block(&self) -> &[u8] {
        match self {
            TestMessage::Block(data) => data,
            _ => &[],
        }
    }

    fn attach_block(&mut self, data: Vec<u8>) {
        *self = TestMessage::Block(data);
    }
}

pub struct TestMessageFactory;

impl MessageFactory for TestMessageFactory {
    type Message = TestMessage;

    fn num_types(&self) -> usize {
        3
    }

    fn create_message(&self, type_index: usize) -> Option<TestMessage> {
        match type_index {
            0 => Some(TestMessage::Sequence(0)),
            1 => Some(TestMessage::Value(0)),
            2 => Some(TestMessage::Block(Vec::new())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

struct InFlightPacket {
    delivery_time: f64,
    direction: Direction,
    sequence: u16,
    data: Vec<u8>,
}

/// A datagram link with configurable latency, jitter, loss and duplicates.
///
/// Packets are dropped, delayed and duplicated at send time with a seeded
/// rng, so every run of a scenario sees the same network.
pub struct TestLink {
    rng: StdRng,
    /// One-way latency in seconds.
    pub latency: f64,
    /// Delivery time noise, +/- this many seconds.
    pub jitter: f64,
    /// Percent of packets dropped outright.
    pub packet_loss: f64,
    /// Percent of packets delivered a second time, up to a second late.
    pub duplicates: f64,
    in_flight: Vec<InFlightPacket>,
}

impl TestLink {
    pub fn new(seed: u64) -> TestLink {
        TestLink {
            rng: StdRng::seed_from_u64(seed),
            latency: 0.0,
            jitter: 0.0,
            packet_loss: 0.0,
            duplicates: 0.0,
            in_flight: Vec::new(),
        }
    }

    pub fn send(&mut self, time: f64, direction: Direction, sequence: u16, data: &[u8]) {
        if self.rng.gen::<f64>() * 100.0 < self.packet_loss {
            return;
        }

        let jitter = if self.jitter > 0.0 {
            self.rng.gen_range(-self.jitter..self.jitter)
        } else {
            0.0
        };
        self.in_flight.push(InFlightPacket {
            delivery_time: time + self.latency + jitter,
            direction,
            sequence,
            data: data.to_vec(),
        });

        if self.rng.gen::<f64>() * 100.0 < self.duplicates {
            self.in_flight.push(InFlightPacket {
                delivery_time: time + self.latency + self.rng.gen_range(0.0..1.0),
                direction,
                sequence,
                data: data.to_vec(),
            });
        }
    }

    /// Take every packet for `direction` whose delivery time has passed,
    /// in delivery order.
    pub fn deliver(&mut self, time: f64, direction: Direction) -> Vec<(u16, Vec<u8>)> {
        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(self.in_flight.len());
        for packet in self.in_flight.drain(..) {
            if packet.direction == direction && packet.delivery_time <= time {
                due.push(packet);
            } else {
                remaining.push(packet);
            }
        }
        self.in_flight = remaining;
        due.sort_by(|a, b| a.delivery_time.total_cmp(&b.delivery_time));
        due.into_iter()
            .map(|packet| (packet.sequence, packet.data))
            .collect()
    }
}

pub struct TestEndpoint<F: MessageFactory> {
    pub connection: Connection<F>,
    pub sequence: u16,
}

impl<F: MessageFactory> TestEndpoint<F> {
    pub fn new(connection: Connection<F>) -> TestEndpoint<F> {
        TestEndpoint {
            connection,
            sequence: 0,
        }
    }
}

/// One tick of the packet exchange: both endpoints emit a packet into the
/// link, both drain what the link delivers, acks flow back for every
/// packet that decoded, and time advances.
pub fn pump<F: MessageFactory>(
    time: &mut f64,
    delta_time: f64,
    link: &mut TestLink,
    client: &mut TestEndpoint<F>,
    server: &mut TestEndpoint<F>,
) {
    let mut buffer = [0u8; MAX_TEST_PACKET_BYTES];

    let bytes_written = client.connection.generate_packet(client.sequence, &mut buffer);
    if bytes_written > 0 {
        link.send(
            *time,
            Direction::ClientToServer,
            client.sequence,
            &buffer[..bytes_written],
        );
    }
    client.sequence = client.sequence.wrapping_add(1);

    let bytes_written = server.connection.generate_packet(server.sequence, &mut buffer);
    if bytes_written > 0 {
        link.send(
            *time,
            Direction::ServerToClient,
            server.sequence,
            &buffer[..bytes_written],
        );
    }
    server.sequence = server.sequence.wrapping_add(1);

    for (sequence, packet) in link.deliver(*time, Direction::ClientToServer) {
        if server.connection.process_packet(sequence, &packet) {
            client.connection.process_acks(&[sequence]);
        }
    }
    for (sequence, packet) in link.deliver(*time, Direction::ServerToClient) {
        if client.connection.process_packet(sequence, &packet) {
            server.connection.process_acks(&[sequence]);
        }
    }

    *time += delta_time;
    client.connection.advance_time(*time);
    server.connection.advance_time(*time);
}
