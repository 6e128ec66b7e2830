//! End-to-end scenarios driven over an in-process duplex pipe (no socket), exercising
//! the full pipeline `TransportContext -> TransportClient/ChannelHandler -> RequestHandler
//! /ResponseHandler` the way two real peers would see it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use wire_transport::buffer::ManagedBuffer;
use wire_transport::context::TransportContext;
use wire_transport::error::TransportError;
use wire_transport::rpc_handler::{
    ChunkReceivedCallback, ReverseClient, RpcHandler, RpcResponseCallback, UploadStreamReceiver,
};
use wire_transport::stream_manager::{OneForOneStreamManager, StreamManager};
use wire_transport::{StreamCallback, TransportClient, TransportConfig};

fn fast_config() -> TransportConfig {
    TransportConfig {
        connection_timeout: Duration::from_secs(30),
        max_chunks_being_transferred: 256,
        close_idle_connections: true,
    }
}

/// Wires up two `TransportClient`s talking over an in-memory duplex pipe, one fronted
/// by `server_handler` and the other by a handler that answers nothing (only the
/// server side is under test in these scenarios).
async fn connect_pair(
    server_handler: Arc<dyn RpcHandler>,
) -> (Arc<TransportClient>, Arc<TransportClient>) {
    let (client_side, server_side) = tokio::io::duplex(1 << 20);

    let client_ctx = TransportContext::new(Arc::new(NullHandler::default()), fast_config());
    let server_ctx = TransportContext::new(server_handler, fast_config());

    let client = client_ctx.attach_duplex(client_side, "client-end".to_string());
    let server = server_ctx.attach_duplex(server_side, "server-end".to_string());

    (client, server)
}

/// A handler that never expects to be called; used for the end that only issues
/// requests in a given scenario.
#[derive(Default)]
struct NullHandler {
    stream_manager: OnceStreamManager,
}

#[derive(Default)]
struct OnceStreamManager(Mutex<Option<Arc<dyn StreamManager>>>);

impl OnceStreamManager {
    fn get(&self) -> Arc<dyn StreamManager> {
        let mut slot = self.0.lock().unwrap();
        slot.get_or_insert_with(|| Arc::new(OneForOneStreamManager::new()) as Arc<dyn StreamManager>).clone()
    }
}

#[async_trait]
impl RpcHandler for NullHandler {
    async fn receive(&self, _client: ReverseClient, _message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
        callback.on_failure(TransportError::Handler("unexpected inbound rpc".to_string()));
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> {
        self.stream_manager.get()
    }
}

/// S1: echoes the request body back as the response.
struct EchoHandler {
    stream_manager: Arc<dyn StreamManager>,
}

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn receive(&self, _client: ReverseClient, message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
        callback.on_success(message);
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> {
        self.stream_manager.clone()
    }
}

#[tokio::test]
async fn s1_rpc_echo() {
    let handler = Arc::new(EchoHandler { stream_manager: Arc::new(OneForOneStreamManager::new()) });
    let (client, _server) = connect_pair(handler).await;

    let response = client.send_rpc_sync(Bytes::from_static(b"hello"), Duration::from_millis(1000)).await;
    assert_eq!(response.unwrap(), Bytes::from_static(b"hello"));
}

/// S2: always fails with a fixed message.
struct FailingHandler {
    stream_manager: Arc<dyn StreamManager>,
}

#[async_trait]
impl RpcHandler for FailingHandler {
    async fn receive(&self, _client: ReverseClient, _message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
        callback.on_failure(TransportError::Handler("deliberate failure".to_string()));
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> {
        self.stream_manager.clone()
    }
}

#[tokio::test]
async fn s2_rpc_failure_surfaces_the_handler_error() {
    let handler = Arc::new(FailingHandler { stream_manager: Arc::new(OneForOneStreamManager::new()) });
    let (client, _server) = connect_pair(handler).await;

    let err = client.send_rpc_sync(Bytes::from_static(b"anything"), Duration::from_millis(1000)).await.unwrap_err();
    assert!(err.to_string().contains("deliberate failure"), "got: {err}");
}

struct CountingFetchCallback {
    got: Arc<Mutex<Vec<(i32, Bytes)>>>,
    done: Arc<Notify>,
    expect: usize,
}

impl ChunkReceivedCallback for CountingFetchCallback {
    fn on_success(&mut self, chunk_index: i32, chunk: Bytes) {
        let mut got = self.got.lock().unwrap();
        got.push((chunk_index, chunk));
        if got.len() >= self.expect {
            self.done.notify_one();
        }
    }
    fn on_failure(&mut self, _chunk_index: i32, _error: TransportError) {
        self.done.notify_one();
    }
}

struct FailureRecordingFetchCallback {
    error: Arc<Mutex<Option<TransportError>>>,
    done: Arc<Notify>,
}

impl ChunkReceivedCallback for FailureRecordingFetchCallback {
    fn on_success(&mut self, _chunk_index: i32, _chunk: Bytes) {
        self.done.notify_one();
    }
    fn on_failure(&mut self, _chunk_index: i32, error: TransportError) {
        *self.error.lock().unwrap() = Some(error);
        self.done.notify_one();
    }
}

/// Exposes the stream manager it serves chunks out of so a test can register streams
/// directly (bypassing the normal "some RPC hands out a stream id" flow).
struct StreamingHandler {
    stream_manager: Arc<dyn StreamManager>,
}

#[async_trait]
impl RpcHandler for StreamingHandler {
    async fn receive(&self, _client: ReverseClient, _message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
        callback.on_failure(TransportError::Handler("not used by this scenario".to_string()));
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> {
        self.stream_manager.clone()
    }
}

#[tokio::test]
async fn s3_fetch_delivers_chunks_in_order_and_rejects_out_of_order_fetches() {
    let manager = Arc::new(OneForOneStreamManager::new());
    let handler = Arc::new(StreamingHandler { stream_manager: manager.clone() });
    let (client, _server) = connect_pair(handler).await;

    let buffers = vec![
        ManagedBuffer::from_memory(&b"b0"[..]),
        ManagedBuffer::from_memory(&b"b1"[..]),
        ManagedBuffer::from_memory(&b"b2"[..]),
    ];
    let stream_id = manager.register_stream(None, buffers, "server-end");

    // Fetching chunk 1 before chunk 0 is an ordering violation.
    let error = Arc::new(Mutex::new(None));
    let done = Arc::new(Notify::new());
    let sid: u64 = stream_id.parse().unwrap();
    client
        .fetch_chunk(
            sid,
            1,
            Box::new(FailureRecordingFetchCallback { error: error.clone(), done: done.clone() }),
        )
        .await;
    done.notified().await;
    let err = error.lock().unwrap().take().expect("expected an out-of-order failure");
    assert!(err.to_string().contains("ordering"), "got: {err}");

    // Chunks fetched in order succeed and arrive as b0, b1, b2.
    let got = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notify::new());
    for i in 0..3 {
        client
            .fetch_chunk(
                sid,
                i,
                Box::new(CountingFetchCallback { got: got.clone(), done: done.clone(), expect: 3 }),
            )
            .await;
    }
    tokio::time::timeout(Duration::from_millis(500), done.notified()).await.ok();

    let got = got.lock().unwrap();
    assert_eq!(got.len(), 3);
    let mut sorted = got.clone();
    sorted.sort_by_key(|(idx, _)| *idx);
    assert_eq!(sorted[0], (0, Bytes::from_static(b"b0")));
    assert_eq!(sorted[1], (1, Bytes::from_static(b"b1")));
    assert_eq!(sorted[2], (2, Bytes::from_static(b"b2")));
}

struct RecordingUploadReceiver {
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl UploadStreamReceiver for RecordingUploadReceiver {
    async fn on_data(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        self.data.lock().unwrap().extend_from_slice(&chunk);
        Ok(())
    }
    async fn on_complete(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct UploadHandler {
    stream_manager: Arc<dyn StreamManager>,
    meta: Arc<Mutex<Option<Bytes>>>,
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl RpcHandler for UploadHandler {
    async fn receive(&self, _client: ReverseClient, _message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
        callback.on_failure(TransportError::Handler("not used by this scenario".to_string()));
    }

    async fn receive_stream(
        &self,
        _client: ReverseClient,
        meta: Bytes,
    ) -> Result<Box<dyn UploadStreamReceiver>, TransportError> {
        *self.meta.lock().unwrap() = Some(meta);
        Ok(Box::new(RecordingUploadReceiver { data: self.data.clone() }))
    }

    fn stream_manager(&self) -> Arc<dyn StreamManager> {
        self.stream_manager.clone()
    }
}

struct OneShotRpcCallback(Option<oneshot::Sender<Result<Bytes, TransportError>>>);

impl RpcResponseCallback for OneShotRpcCallback {
    fn on_success(&mut self, response: Bytes) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(response));
        }
    }
    fn on_failure(&mut self, error: TransportError) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(error));
        }
    }
}

#[tokio::test]
async fn s4_upload_delivers_meta_and_data_then_completes() {
    let meta_slot = Arc::new(Mutex::new(None));
    let data_slot = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(UploadHandler {
        stream_manager: Arc::new(OneForOneStreamManager::new()),
        meta: meta_slot.clone(),
        data: data_slot.clone(),
    });
    let (client, _server) = connect_pair(handler).await;

    let payload = vec![0_u8; 2 * 1024 * 1024];
    let (tx, rx) = oneshot::channel();
    client
        .upload_stream(
            Bytes::from_static(b"hdr"),
            Bytes::from(payload.clone()),
            Box::new(OneShotRpcCallback(Some(tx))),
        )
        .await;

    let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(meta_slot.lock().unwrap().as_deref(), Some(&b"hdr"[..]));
    assert_eq!(data_slot.lock().unwrap().len(), payload.len());
    assert!(data_slot.lock().unwrap().iter().all(|b| *b == 0));
}

#[tokio::test]
async fn s5_connection_drop_fails_every_outstanding_rpc() {
    let handler = Arc::new(NullHandler::default());
    let (client, _server) = connect_pair(handler).await;

    // The null handler on the other end never answers, so these three stay
    // outstanding until the client closes its own side.
    let mut slots = Vec::new();
    for _ in 0..3 {
        let slot = Arc::new(Mutex::new(None));
        struct RecordingCallback(Arc<Mutex<Option<TransportError>>>);
        impl RpcResponseCallback for RecordingCallback {
            fn on_success(&mut self, _response: Bytes) {}
            fn on_failure(&mut self, error: TransportError) {
                *self.0.lock().unwrap() = Some(error);
            }
        }
        client.send_rpc(Bytes::from_static(b"pending"), Box::new(RecordingCallback(slot.clone()))).await;
        slots.push(slot);
    }

    client.close().await;
    // Give the teardown task a moment to run; `close` itself drains synchronously,
    // but the callbacks above were registered before the write, not raced with it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for slot in slots {
        let error = slot.lock().unwrap().take().expect("expected a failure from the connection drop");
        assert!(error.to_string().contains("client-end") || error.to_string().contains("closed"), "got: {error}");
    }
}

#[tokio::test]
async fn s6_one_way_message_gets_no_response_and_is_delivered_once() {
    let seen = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());

    struct OneWayHandler {
        stream_manager: Arc<dyn StreamManager>,
        seen: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl RpcHandler for OneWayHandler {
        async fn receive(&self, _client: ReverseClient, _message: Bytes, mut callback: Box<dyn RpcResponseCallback>) {
            callback.on_failure(TransportError::Handler("rpc path should not be hit by a one-way send".to_string()));
        }

        async fn receive_one_way(&self, _client: ReverseClient, message: Bytes) {
            assert_eq!(&message[..], b"x");
            self.seen.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        }

        fn stream_manager(&self) -> Arc<dyn StreamManager> {
            self.stream_manager.clone()
        }
    }

    let handler = Arc::new(OneWayHandler {
        stream_manager: Arc::new(OneForOneStreamManager::new()),
        seen: seen.clone(),
        notify: notify.clone(),
    });
    let (client, _server) = connect_pair(handler).await;

    client.send(Bytes::from_static(b"x")).await;
    tokio::time::timeout(Duration::from_secs(1), notify.notified()).await.unwrap();
    assert!(seen.load(Ordering::SeqCst));
}

struct CollectingStreamCallback {
    data: Arc<Mutex<Vec<u8>>>,
    done: Arc<Notify>,
}

impl StreamCallback for CollectingStreamCallback {
    fn on_data(&mut self, chunk: Bytes) {
        self.data.lock().unwrap().extend_from_slice(&chunk);
    }
    fn on_complete(&mut self) {
        self.done.notify_one();
    }
    fn on_failure(&mut self, _error: TransportError) {
        self.done.notify_one();
    }
}

#[tokio::test]
async fn stream_pull_delivers_the_registered_buffer_then_completes() {
    let manager = Arc::new(OneForOneStreamManager::new());
    let handler = Arc::new(StreamingHandler { stream_manager: manager.clone() });
    let (client, _server) = connect_pair(handler).await;

    let stream_id =
        manager.register_stream(None, vec![ManagedBuffer::from_memory(&b"whole-stream-body"[..])], "server-end");
    let chunk_id = format!("{stream_id}_0");

    let data = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notify::new());
    client.stream(chunk_id, Box::new(CollectingStreamCallback { data: data.clone(), done: done.clone() })).await;
    tokio::time::timeout(Duration::from_secs(1), done.notified()).await.unwrap();

    assert_eq!(&data.lock().unwrap()[..], b"whole-stream-body");
}

/// Property 7: a channel with no outstanding requests closes on its own once it has
/// been idle past `connection_timeout`.
#[tokio::test]
async fn idle_connection_with_no_outstanding_requests_closes_itself() {
    let config =
        TransportConfig { connection_timeout: Duration::from_millis(100), ..fast_config() };
    let (client_side, server_side) = tokio::io::duplex(4096);
    let client_ctx = TransportContext::new(Arc::new(NullHandler::default()), config);
    let server_ctx = TransportContext::new(Arc::new(NullHandler::default()), config);

    let client = client_ctx.attach_duplex(client_side, "client-end".to_string());
    let _server = server_ctx.attach_duplex(server_side, "server-end".to_string());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.is_active() || !client.is_timed_out());
}
