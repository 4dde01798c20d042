mod common;

use common::{
    init_logging, pump, TestEndpoint, TestLink, TestMessage, TestMessageFactory,
};
use netchan::{
    channel::ChannelErrorLevel,
    config::{ChannelConfig, ChannelType, ClientServerConfig},
    connection::{Connection, ConnectionErrorLevel},
};

fn endpoints(
    config: &ClientServerConfig,
    time: f64,
) -> (TestEndpoint<TestMessageFactory>, TestEndpoint<TestMessageFactory>) {
    let client = TestEndpoint::new(Connection::new(
        TestMessageFactory,
        config.connection.clone(),
        time,
    ));
    let server = TestEndpoint::new(Connection::new(
        TestMessageFactory,
        config.connection.clone(),
        time,
    ));
    (client, server)
}

#[test]
fn reliable_ordered_messages_no_loss() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(2);
    config.connection.channels[0].max_messages_per_packet = 8;
    config.connection.channels[0].message_send_queue_size = 1024;

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0x5e41);

    for i in 0..64u16 {
        assert!(client.connection.can_send_message(0));
        client.connection.send_message(0, TestMessage::Sequence(i));
    }

    let mut expected = 0u16;
    for _ in 0..100 {
        pump(&mut time, delta_time, &mut link, &mut client, &mut server);

        while let Some((id, message)) = server.connection.receive_message(0) {
            assert_eq!(id, expected);
            assert_eq!(message, TestMessage::Sequence(expected));
            expected += 1;
        }

        if expected == 64 && !client.connection.has_messages_to_send(0) {
            break;
        }
    }

    assert_eq!(expected, 64);
    assert!(!client.connection.has_messages_to_send(0));
    assert_eq!(client.connection.error_level(), ConnectionErrorLevel::None);
    assert_eq!(server.connection.error_level(), ConnectionErrorLevel::None);
}

#[test]
fn reliable_blocks_survive_heavy_loss() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(1);
    config.connection.channels[0].block_fragment_size = 1024;
    config.connection.channels[0].max_block_size = 64 * 1024;

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0xb10c);
    link.packet_loss = 90.0;

    let num_blocks = 16usize;
    for i in 0..num_blocks {
        let size = 1 + (i * 901) % 3333;
        let data: Vec<u8> = (0..size).map(|j| ((i + j) % 256) as u8).collect();
        client.connection.send_message(0, TestMessage::Block(data));
    }

    let mut received = 0usize;
    for iteration in 0..20_000 {
        pump(&mut time, delta_time, &mut link, &mut client, &mut server);

        while let Some((id, message)) = server.connection.receive_message(0) {
            assert_eq!(id as usize, received);
            let size = 1 + (received * 901) % 3333;
            match &message {
                TestMessage::Block(data) => {
                    assert_eq!(data.len(), size, "block {received} size");
                    for (j, &byte) in data.iter().enumerate() {
                        assert_eq!(byte, ((received + j) % 256) as u8, "block {received} byte {j}");
                    }
                }
                other => panic!("expected a block, got {other:?}"),
            }
            received += 1;
        }

        if received == num_blocks {
            println!("all blocks received after {iteration} iterations");
            break;
        }
    }

    assert_eq!(received, num_blocks);
    assert_eq!(client.connection.error_level(), ConnectionErrorLevel::None);
    assert_eq!(server.connection.error_level(), ConnectionErrorLevel::None);
}

#[test]
fn unreliable_messages_under_loss_duplicates_and_jitter() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(1);
    config.connection.channels[0] = ChannelConfig::new(ChannelType::UnreliableUnordered);

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0x1077e);
    link.packet_loss = 25.0;
    link.duplicates = 25.0;
    link.latency = 0.05;
    link.jitter = 0.1;

    let num_messages = 16u64;
    let mut received_values = Vec::new();

    for i in 0..120 {
        if i < num_messages {
            client.connection.send_message(0, TestMessage::Value(i));
        }

        pump(&mut time, delta_time, &mut link, &mut client, &mut server);

        while let Some((_, message)) = server.connection.receive_message(0) {
            match message {
                TestMessage::Value(value) => {
                    // anything that arrives decoded correctly and came
                    // from the sent set; duplicates and reorder are fine
                    assert!(value < num_messages);
                    received_values.push(value);
                }
                other => panic!("expected a value, got {other:?}"),
            }
        }
    }

    assert!(
        received_values.len() >= 8,
        "expected most of {num_messages} messages through 25% loss, got {}",
        received_values.len()
    );
    assert_eq!(client.connection.error_level(), ConnectionErrorLevel::None);
    assert_eq!(server.connection.error_level(), ConnectionErrorLevel::None);
}

#[test]
fn send_queue_overflow_errors_channel() {
    init_logging();

    let mut config = ClientServerConfig::new(1);
    config.connection.channels[0].message_send_queue_size = 32;

    let mut client: Connection<TestMessageFactory> =
        Connection::new(TestMessageFactory, config.connection.clone(), 100.0);

    for i in 0..33u64 {
        client.send_message(0, TestMessage::Value(i));
    }

    // the first 32 queued; the 33rd was dropped and errored the channel
    assert_eq!(client.channel(0).counters().sent, 32);
    assert_eq!(
        client.channel(0).error_level(),
        ChannelErrorLevel::SendQueueFull
    );

    client.advance_time(100.1);
    assert_eq!(client.error_level(), ConnectionErrorLevel::Channel);
}

#[test]
fn stalled_receiver_desyncs_and_tears_down() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(1);
    config.connection.channels[0].message_send_queue_size = 1024;
    config.connection.channels[0].message_receive_queue_size = 256;

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0xde5);

    for i in 0..1024u64 {
        client.connection.send_message(0, TestMessage::Value(i));
    }

    // the server never dequeues; once the client pushes past the receive
    // window the server must kick itself off
    let mut torn_down_after = None;
    for iteration in 0..4 * 1024 {
        pump(&mut time, delta_time, &mut link, &mut client, &mut server);
        if server.connection.error_level() != ConnectionErrorLevel::None {
            torn_down_after = Some(iteration);
            break;
        }
    }

    let iterations = torn_down_after.expect("server should desync");
    println!("server tore down after {iterations} iterations");
    assert_eq!(server.connection.error_level(), ConnectionErrorLevel::Channel);
    assert_eq!(
        server.connection.channel(0).error_level(),
        ChannelErrorLevel::Desync
    );
}

#[test]
fn mixed_budget_channels_deliver_both_blocks() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(2);
    config.connection.channels[0] = ChannelConfig::new(ChannelType::UnreliableUnordered);
    config.connection.channels[0].packet_budget = Some(8000);
    config.connection.channels[0].max_block_size = 8 * 1024;
    config.connection.channels[1].packet_budget = None;
    config.connection.channels[1].max_block_size = 8 * 1024;

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0x6b);

    let unreliable_block: Vec<u8> = (0..7169u32).map(|i| (i % 251) as u8).collect();
    let reliable_block: Vec<u8> = (0..1024u32).map(|i| (i % 253) as u8).collect();

    client.connection.send_message(0, TestMessage::Block(unreliable_block.clone()));
    client.connection.send_message(1, TestMessage::Block(reliable_block.clone()));

    let mut got_unreliable = None;
    let mut got_reliable = None;
    for _ in 0..3 {
        pump(&mut time, delta_time, &mut link, &mut client, &mut server);
        if let Some((_, TestMessage::Block(data))) = server.connection.receive_message(0) {
            got_unreliable = Some(data);
        }
        if let Some((_, TestMessage::Block(data))) = server.connection.receive_message(1) {
            got_reliable = Some(data);
        }
    }

    assert_eq!(got_unreliable.as_deref(), Some(&unreliable_block[..]));
    assert_eq!(got_reliable.as_deref(), Some(&reliable_block[..]));
    assert_eq!(client.connection.error_level(), ConnectionErrorLevel::None);
    assert_eq!(server.connection.error_level(), ConnectionErrorLevel::None);
}

#[test]
fn full_size_block_is_deliverable() {
    init_logging();

    let mut time = 100.0;
    let delta_time = 1.0 / 30.0;

    let mut config = ClientServerConfig::new(1);
    config.connection.channels[0].max_block_size = 4096;
    config.connection.channels[0].block_fragment_size = 1024;

    let (mut client, mut server) = endpoints(&config, time);
    let mut link = TestLink::new(0xf111);

    let block = vec![0x77u8; 4096];
    client.connection.send_message(0, TestMessage::Block(block.clone()));

    let mut delivered = None;
    for _ in 0..20 {
        pump(&mut time, delta_time, &mut link, &mut client, &mut server);
        if let Some((id, message)) = server.connection.receive_message(0) {
            delivered = Some((id, message));
            break;
        }
    }

    let (id, message) = delivered.expect("a block of exactly max_block_size must deliver");
    assert_eq!(id, 0);
    assert_eq!(message, TestMessage::Block(block));
}
