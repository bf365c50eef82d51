use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use cbkv_client::{
    Cas, Client, ClientConfig, ClientError, JsonTranscoder, MutateInBuilder, NodeHealth, PoolSettings, Status,
};
use cbkv_common::{
    decode_frame, decode_mutation_blocks, encode_mutation_failure, Frame, Opcode, ResponseFrame, DATATYPE_JSON,
    REQUEST_MAGIC,
};

type Handler = fn(usize, &Frame, &mut TcpStream);

/// Fake node: accepts one connection and answers `expected_requests`
/// frames through `handler`. Every request is forwarded to the returned
/// receiver for inspection.
fn spawn_node(expected_requests: usize, handler: Handler) -> (String, Receiver<Frame>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut buf = BytesMut::new();
        for idx in 0..expected_requests {
            let Some(frame) = read_request(&mut stream, &mut buf) else {
                return;
            };
            let _ = tx.send(frame.clone());
            handler(idx, &frame, &mut stream);
        }
        // Hold the connection open until the client is done with it.
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink);
    });

    (addr, rx)
}

fn read_request(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decode_frame(buf, REQUEST_MAGIC).expect("request frame") {
            return Some(frame);
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn reply(stream: &mut TcpStream, request: &Frame, opaque: u32, status: Status, cas: u64, extras: &[u8], value: &[u8]) {
    let mut out = BytesMut::new();
    ResponseFrame {
        opcode: request.header.opcode,
        datatype: if value.is_empty() { 0 } else { DATATYPE_JSON },
        status,
        opaque,
        cas,
        extras,
        key: &[],
        value,
    }
    .encode(&mut out)
    .expect("encode response");
    stream.write_all(&out).expect("write response");
}

fn config(addr: &str) -> ClientConfig {
    ClientConfig {
        servers: vec![addr.to_string()],
        vbucket_count: 64,
        operation_timeout_ms: 1_000,
        pool: PoolSettings {
            min_pool_size: 0,
            max_pool_size: 1,
            connection_timeout_ms: 500,
            queue_timeout_ms: 200,
            receive_timeout_ms: 300,
            dead_timeout_ms: 60_000,
            ..PoolSettings::default()
        },
    }
}

#[test]
fn test_touch_sends_expiry_and_returns_cas() {
    let (addr, requests) = spawn_node(1, |_, frame, stream| {
        reply(stream, frame, frame.opaque(), Status::Success, 9, &[], &[]);
    });
    let client = Client::connect(&config(&addr)).expect("client");

    let cas = client.touch("session", Duration::from_secs(60)).expect("touch");
    assert_eq!(cas, Cas(9));

    let request = requests.recv().expect("request");
    assert_eq!(request.header.opcode, Opcode::Touch.as_u8());
    assert_eq!(&request.key[..], b"session");
    assert_eq!(&request.extras[..], &60u32.to_be_bytes());
}

#[test]
fn test_get_decodes_json_document() {
    let (addr, _requests) = spawn_node(1, |_, frame, stream| {
        let flags = 0x0200_0000u32.to_be_bytes();
        reply(stream, frame, frame.opaque(), Status::Success, 3, &flags, br#"{"visits":4}"#);
    });
    let client = Client::connect(&config(&addr)).expect("client");

    let (doc, cas): (serde_json::Value, Cas) = client.get("user::1", &JsonTranscoder).expect("get");
    assert_eq!(doc, serde_json::json!({"visits": 4}));
    assert_eq!(cas, Cas(3));
}

#[test]
fn test_stale_response_is_discarded() {
    let (addr, _requests) = spawn_node(1, |_, frame, stream| {
        // A late answer to an earlier request, then the real one.
        reply(stream, frame, frame.opaque().wrapping_add(1000), Status::KeyNotFound, 0, &[], &[]);
        reply(stream, frame, frame.opaque(), Status::Success, 0, &[], &[]);
    });
    let client = Client::connect(&config(&addr)).expect("client");

    client.noop(0).expect("noop");
    assert_eq!(client.nodes()[0].pool().stats().stale_responses, 1);
}

#[test]
fn test_error_status_maps_to_server_error() {
    let (addr, _requests) = spawn_node(1, |_, frame, stream| {
        reply(stream, frame, frame.opaque(), Status::KeyNotFound, 0, &[], &[]);
    });
    let client = Client::connect(&config(&addr)).expect("client");

    match client.remove("missing") {
        Err(ClientError::Server { opcode, status }) => {
            assert_eq!(opcode, Opcode::Delete);
            assert_eq!(status, Status::KeyNotFound);
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(client.nodes()[0].health(), NodeHealth::Alive);
}

#[test]
fn test_multi_mutation_sends_specs_in_order_and_reports_failed_index() {
    let (addr, requests) = spawn_node(1, |_, frame, stream| {
        let mut body = BytesMut::new();
        encode_mutation_failure(&mut body, 1, Status::SubdocPathNotFound);
        reply(stream, frame, frame.opaque(), Status::SubdocMultiPathFailure, 0, &[], &body);
    });
    let client = Client::connect(&config(&addr)).expect("client");

    let builder = MutateInBuilder::new("doc")
        .delete("a")
        .and_then(|b| b.upsert("b", &1))
        .expect("builder");
    match client.mutate_in(builder) {
        Err(ClientError::MutationFailed { index, status }) => {
            assert_eq!(index, 1);
            assert_eq!(status, Status::SubdocPathNotFound);
        }
        other => panic!("expected mutation failure, got {other:?}"),
    }

    let request = requests.recv().expect("request");
    assert_eq!(request.header.opcode, Opcode::SubdocMultiMutation.as_u8());
    let blocks = decode_mutation_blocks(&request.value).expect("blocks");
    let paths: Vec<&[u8]> = blocks.iter().map(|block| &block.path[..]).collect();
    assert_eq!(paths, vec![&b"a"[..], &b"b"[..]]);
    assert_eq!(blocks[0].opcode, Opcode::SubdocDelete);
    assert_eq!(blocks[1].opcode, Opcode::SubdocDictUpsert);
}

#[test]
fn test_receive_timeout_keeps_node_alive_and_connection_usable() {
    let (addr, _requests) = spawn_node(2, |idx, frame, stream| {
        if idx == 1 {
            reply(stream, frame, frame.opaque(), Status::Success, 0, &[], &[]);
        }
    });
    let client = Client::connect(&config(&addr)).expect("client");

    assert!(matches!(client.noop(0), Err(ClientError::ReceiveTimeout { .. })));
    assert_eq!(client.nodes()[0].health(), NodeHealth::Alive);

    client.noop(0).expect("second noop on the same connection");
    let stats = client.nodes()[0].pool().stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.destroyed, 0);
}

#[test]
fn test_unreachable_node_is_gated_after_failure() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let client = Client::connect(&config(&addr)).expect("client");

    let first = client.noop(0).unwrap_err();
    assert!(first.is_node_failure(), "unexpected error {first:?}");
    assert_eq!(client.nodes()[0].health(), NodeHealth::Dead);

    assert!(matches!(client.noop(0), Err(ClientError::NodeDead { .. })));
    let stats = client.nodes()[0].pool().stats();
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.rejected_dead, 1);
}

#[test]
fn test_invalid_pool_config_is_rejected() {
    let mut config = config("127.0.0.1:1");
    config.pool.min_pool_size = 20;
    config.pool.max_pool_size = 10;
    assert!(matches!(Client::connect(&config), Err(ClientError::Config(_))));
}
