//! # TCP Server
//!
//! Accept binary-protocol connections, decode request frames, and dispatch
//! them to the document store.
//!
//! ## Notes
//! - A frame with an unknown opcode gets `UnknownCommand`; a frame that
//!   cannot be decoded at all closes the connection.
//! - `spawn_background` runs the server on its own runtime thread so that
//!   blocking client tests can talk to it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cbkv_common::{
    decode_frame, decode_mutation_blocks, encode_mutation_failure, encode_mutation_result, Expiry, Frame,
    MutationKind, Opcode, ResponseFrame, SinglePathExtras, Status, MAX_MUTATION_SPECS, REQUEST_MAGIC,
};

use crate::store::{Document, MutateError, MutateOutcome, PathMutation, Store};

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, store: Arc<Store>, shutdown: F) -> io::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let store = store.clone();
                tokio::spawn(async move {
                    debug!(%peer, "connection accepted");
                    if let Err(err) = handle_connection(stream, store).await {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

/// Handles a single client connection.
pub async fn handle_connection(stream: TcpStream, store: Arc<Store>) -> io::Result<()> {
    let mut stream = stream;
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match decode_frame(&mut buffer, REQUEST_MAGIC) {
                Ok(Some(frame)) => dispatch(&frame, store.as_ref(), &mut out),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "protocol error, closing connection");
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }

    Ok(())
}

/// Appends the response to `frame` to `out`.
pub fn dispatch(frame: &Frame, store: &Store, out: &mut BytesMut) {
    let opcode = match frame.opcode() {
        Ok(opcode) => opcode,
        Err(_) => return write_status(out, frame, Status::UnknownCommand),
    };

    match opcode {
        Opcode::Get => match store.get(&frame.key) {
            Ok(doc) => write_document(out, frame, &doc),
            Err(status) => write_status(out, frame, status),
        },
        Opcode::GetAndTouch => match read_expiry(&frame.extras).map(|expiry| store.touch(&frame.key, expiry)) {
            Some(Ok(doc)) => write_document(out, frame, &doc),
            Some(Err(status)) => write_status(out, frame, status),
            None => write_status(out, frame, Status::InvalidArguments),
        },
        Opcode::Touch => match read_expiry(&frame.extras).map(|expiry| store.touch(&frame.key, expiry)) {
            Some(Ok(doc)) => write_cas(out, frame, doc.cas, &[]),
            Some(Err(status)) => write_status(out, frame, status),
            None => write_status(out, frame, Status::InvalidArguments),
        },
        Opcode::Set => handle_set(frame, store, out),
        Opcode::Delete => match store.delete(&frame.key, frame.cas()) {
            Ok(cas) => write_cas(out, frame, cas, &[]),
            Err(status) => write_status(out, frame, status),
        },
        Opcode::Noop => write_status(out, frame, Status::Success),
        Opcode::Sync => {
            let status = handle_sync(&frame.value, store);
            write_status(out, frame, status);
        }
        Opcode::SubdocMultiMutation => handle_multi_mutation(frame, store, out),
        Opcode::SubdocGet | Opcode::SubdocExists | Opcode::SubdocMultiLookup => {
            write_status(out, frame, Status::NotSupported)
        }
        other => match MutationKind::from_opcode(other) {
            Some(kind) => handle_single_mutation(kind, frame, store, out),
            None => write_status(out, frame, Status::UnknownCommand),
        },
    }
}

fn handle_set(frame: &Frame, store: &Store, out: &mut BytesMut) {
    if frame.extras.len() != 8 {
        return write_status(out, frame, Status::InvalidArguments);
    }
    let mut extras = &frame.extras[..];
    let flags = extras.get_u32();
    let expiry = Expiry::from_raw(extras.get_u32());
    let result = store.set(
        frame.key.clone(),
        frame.value.clone(),
        flags,
        frame.header.datatype,
        expiry,
        frame.cas(),
    );
    match result {
        Ok(cas) => write_cas(out, frame, cas, &[]),
        Err(status) => write_status(out, frame, status),
    }
}

/// Checks every listed key is present with the expected CAS.
fn handle_sync(value: &Bytes, store: &Store) -> Status {
    let mut body = value.clone();
    if body.remaining() < 6 {
        return Status::InvalidArguments;
    }
    let _flags = body.get_u32();
    let count = body.get_u16();
    for _ in 0..count {
        if body.remaining() < 12 {
            return Status::InvalidArguments;
        }
        let cas = body.get_u64();
        let _vbucket = body.get_u16();
        let key_len = body.get_u16() as usize;
        if body.remaining() < key_len {
            return Status::InvalidArguments;
        }
        let key = body.split_to(key_len);
        match store.get(&key) {
            Ok(doc) if cas != 0 && doc.cas != cas => return Status::KeyExists,
            Ok(_) => {}
            Err(status) => return status,
        }
    }
    Status::Success
}

fn handle_single_mutation(kind: MutationKind, frame: &Frame, store: &Store, out: &mut BytesMut) {
    let extras = match SinglePathExtras::decode(&frame.extras) {
        Ok(extras) => extras,
        Err(_) => return write_status(out, frame, Status::InvalidArguments),
    };
    let path_len = extras.path_len as usize;
    if frame.value.len() < path_len {
        return write_status(out, frame, Status::InvalidArguments);
    }
    let path = match std::str::from_utf8(&frame.value[..path_len]) {
        Ok(path) => path.to_owned(),
        Err(_) => return write_status(out, frame, Status::SubdocPathInvalid),
    };
    let spec = PathMutation {
        kind,
        flags: extras.flags,
        path,
        value: frame.value.slice(path_len..),
    };

    match store.mutate_in(&frame.key, &[spec], extras.expiry.map(Expiry::from_raw), frame.cas()) {
        Ok(MutateOutcome { cas, values }) => {
            let value = values.into_iter().next().map(|(_, value)| value).unwrap_or_default();
            write_cas(out, frame, cas, &value);
        }
        Err(MutateError::Document(status)) | Err(MutateError::Spec { status, .. }) => {
            write_status(out, frame, status)
        }
    }
}

fn handle_multi_mutation(frame: &Frame, store: &Store, out: &mut BytesMut) {
    let expiry = match frame.extras.len() {
        0 => None,
        4 => read_expiry(&frame.extras),
        _ => return write_status(out, frame, Status::InvalidArguments),
    };
    let blocks = match decode_mutation_blocks(&frame.value) {
        Ok(blocks) if !blocks.is_empty() && blocks.len() <= MAX_MUTATION_SPECS => blocks,
        Ok(_) => return write_status(out, frame, Status::SubdocInvalidCombo),
        Err(_) => return write_status(out, frame, Status::InvalidArguments),
    };

    let mut specs = Vec::with_capacity(blocks.len());
    for block in blocks {
        let Some(kind) = MutationKind::from_opcode(block.opcode) else {
            return write_status(out, frame, Status::SubdocInvalidCombo);
        };
        let Ok(path) = String::from_utf8(block.path.to_vec()) else {
            return write_status(out, frame, Status::SubdocPathInvalid);
        };
        specs.push(PathMutation {
            kind,
            flags: block.flags,
            path,
            value: block.value,
        });
    }

    match store.mutate_in(&frame.key, &specs, expiry, frame.cas()) {
        Ok(MutateOutcome { cas, values }) => {
            let mut body = BytesMut::new();
            for (index, value) in values {
                encode_mutation_result(&mut body, index as u8, Status::Success, &value);
            }
            write_cas(out, frame, cas, &body);
        }
        Err(MutateError::Spec { index, status }) => {
            let mut body = BytesMut::with_capacity(3);
            encode_mutation_failure(&mut body, index as u8, status);
            write_response(out, frame, Status::SubdocMultiPathFailure, 0, &[], &body);
        }
        Err(MutateError::Document(status)) => write_status(out, frame, status),
    }
}

fn read_expiry(extras: &[u8]) -> Option<Expiry> {
    let raw: [u8; 4] = extras.try_into().ok()?;
    Some(Expiry::from_raw(u32::from_be_bytes(raw)))
}

fn write_document(out: &mut BytesMut, frame: &Frame, doc: &Document) {
    let flags = doc.flags.to_be_bytes();
    let response = ResponseFrame {
        opcode: frame.header.opcode,
        datatype: doc.datatype,
        status: Status::Success,
        opaque: frame.opaque(),
        cas: doc.cas,
        extras: &flags,
        key: &[],
        value: &doc.value,
    };
    if response.encode(out).is_err() {
        write_status(out, frame, Status::ValueTooLarge);
    }
}

fn write_cas(out: &mut BytesMut, frame: &Frame, cas: u64, value: &[u8]) {
    write_response(out, frame, Status::Success, cas, &[], value);
}

fn write_status(out: &mut BytesMut, frame: &Frame, status: Status) {
    write_response(out, frame, status, 0, &[], &[]);
}

fn write_response(out: &mut BytesMut, frame: &Frame, status: Status, cas: u64, extras: &[u8], value: &[u8]) {
    let response = ResponseFrame {
        opcode: frame.header.opcode,
        datatype: 0,
        status,
        opaque: frame.opaque(),
        cas,
        extras,
        key: &[],
        value,
    };
    if let Err(err) = response.encode(out) {
        warn!(error = %err, "failed to encode response");
    }
}

/// Server running on a background thread; stops when dropped.
pub struct ServerHandle {
    addr: SocketAddr,
    store: Arc<Store>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Store backing the server, for seeding and inspecting documents.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Stops accepting connections and waits for the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds `addr` and serves it from a dedicated runtime thread.
///
/// Bind and runtime errors are returned before the thread starts, so the
/// returned address is already accepting connections.
pub fn spawn_background(addr: &str) -> io::Result<ServerHandle> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local = listener.local_addr()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let store = Arc::new(Store::new());
    let (tx, rx) = oneshot::channel::<()>();

    let served = store.clone();
    let thread = std::thread::Builder::new()
        .name("cbkv-server".into())
        .spawn(move || {
            let result = runtime.block_on(async move {
                let listener = TcpListener::from_std(listener)?;
                serve(listener, served, async {
                    let _ = rx.await;
                })
                .await
            });
            if let Err(err) = result {
                warn!(error = %err, "server stopped with error");
            }
        })?;

    Ok(ServerHandle {
        addr: local,
        store,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbkv_common::{decode_mutation_failure, decode_mutation_results, encode_mutation_block, RequestFrame, RESPONSE_MAGIC};

    fn request(opcode: Opcode, key: &[u8], extras: &[u8], value: &[u8]) -> Frame {
        let mut buf = BytesMut::new();
        RequestFrame {
            opcode,
            datatype: 0,
            vbucket: 0,
            opaque: 42,
            cas: 0,
            extras,
            key,
            value,
        }
        .encode(&mut buf)
        .unwrap();
        decode_frame(&mut buf, REQUEST_MAGIC).unwrap().unwrap()
    }

    fn roundtrip(store: &Store, frame: &Frame) -> Frame {
        let mut out = BytesMut::new();
        dispatch(frame, store, &mut out);
        let response = decode_frame(&mut out, RESPONSE_MAGIC).unwrap().unwrap();
        assert!(out.is_empty());
        response
    }

    fn set_json(store: &Store, key: &[u8], json: &str) {
        let frame = request(Opcode::Set, key, &[0; 8], json.as_bytes());
        assert_eq!(roundtrip(store, &frame).status(), Status::Success);
    }

    #[test]
    fn test_get_returns_flags_and_echoes_opaque() {
        let store = Store::new();
        let mut extras = [0u8; 8];
        extras[..4].copy_from_slice(&0x0200_0000u32.to_be_bytes());
        roundtrip(&store, &request(Opcode::Set, b"k", &extras, b"{}"));

        let response = roundtrip(&store, &request(Opcode::Get, b"k", &[], &[]));
        assert_eq!(response.status(), Status::Success);
        assert_eq!(response.opaque(), 42);
        assert_eq!(&response.extras[..], &0x0200_0000u32.to_be_bytes());
        assert_eq!(&response.value[..], b"{}");
        assert_ne!(response.cas(), 0);
    }

    #[test]
    fn test_unknown_opcode_gets_unknown_command() {
        let store = Store::new();
        let mut buf = BytesMut::new();
        RequestFrame {
            opcode: Opcode::Noop,
            datatype: 0,
            vbucket: 0,
            opaque: 7,
            cas: 0,
            extras: &[],
            key: &[],
            value: &[],
        }
        .encode(&mut buf)
        .unwrap();
        buf[1] = 0x7f;
        let frame = decode_frame(&mut buf, REQUEST_MAGIC).unwrap().unwrap();
        let response = roundtrip(&store, &frame);
        assert_eq!(response.status(), Status::UnknownCommand);
        assert_eq!(response.header.opcode, 0x7f);
    }

    #[test]
    fn test_multi_mutation_failure_reports_index() {
        let store = Store::new();
        set_json(&store, b"doc", r#"{"a": 1}"#);

        let mut value = BytesMut::new();
        encode_mutation_block(&mut value, Opcode::SubdocDictUpsert, 0, b"b", b"2").unwrap();
        encode_mutation_block(&mut value, Opcode::SubdocDelete, 0, b"missing", b"").unwrap();
        let response = roundtrip(&store, &request(Opcode::SubdocMultiMutation, b"doc", &[], &value));

        assert_eq!(response.status(), Status::SubdocMultiPathFailure);
        assert_eq!(decode_mutation_failure(&response.value).unwrap(), (1, Status::SubdocPathNotFound));
    }

    #[test]
    fn test_multi_mutation_returns_counter_results() {
        let store = Store::new();
        set_json(&store, b"doc", r#"{"n": 1}"#);

        let mut value = BytesMut::new();
        encode_mutation_block(&mut value, Opcode::SubdocDictUpsert, 0, b"a", b"true").unwrap();
        encode_mutation_block(&mut value, Opcode::SubdocCounter, 0, b"n", b"4").unwrap();
        let response = roundtrip(&store, &request(Opcode::SubdocMultiMutation, b"doc", &[], &value));

        assert_eq!(response.status(), Status::Success);
        let results = decode_mutation_results(&response.value).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 1);
        assert_eq!(&results[0].value[..], b"5");
    }

    #[test]
    fn test_single_path_delete() {
        let store = Store::new();
        set_json(&store, b"doc", r#"{"a": {"b": 1, "c": 2}}"#);

        let (extras, len) = SinglePathExtras {
            path_len: 3,
            flags: 0,
            expiry: None,
        }
        .encode();
        let response = roundtrip(&store, &request(Opcode::SubdocDelete, b"doc", &extras[..len], b"a.b"));
        assert_eq!(response.status(), Status::Success);

        let doc: serde_json::Value = serde_json::from_slice(&store.get(b"doc").unwrap().value).unwrap();
        assert_eq!(doc, serde_json::json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_sync_checks_keys() {
        let store = Store::new();
        set_json(&store, b"k", "1");

        let mut body = BytesMut::new();
        body.extend_from_slice(&0x04u32.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0u64.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&7u16.to_be_bytes());
        body.extend_from_slice(b"missing");
        let response = roundtrip(&store, &request(Opcode::Sync, b"", &[], &body));
        assert_eq!(response.status(), Status::KeyNotFound);
    }
}
