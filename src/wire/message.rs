//! The typed message set and its wire encoding.
//!
//! A message is encoded as `[u8 type_code][header fields...][optional body buffer]`.
//! Header integers are big-endian; strings are `[i32 length][utf8 bytes]`; a
//! stream-chunk id is `[i64 stream_id][i32 chunk_index]`. `bytes::Buf`/`BufMut`
//! already read and write integers big-endian, so no separate endian-conversion
//! crate is needed here (see DESIGN.md for the dependency this replaced).
//!
//! Body buffers are never copied into the header: decoding takes zero-copy slices
//! of the already-assembled frame payload, and encoding hands the header and the
//! body back as two separate pieces so the caller can write them as distinct
//! regions (see [`crate::channel`]) instead of materializing one combined buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::ManagedBuffer;
use crate::error::TransportError;
use crate::request_id::StreamChunkId;

macro_rules! type_codes {
    ($($name:ident = $code:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        enum TypeCode {
            $($name = $code,)*
        }

        impl TypeCode {
            fn from_byte(b: u8) -> Result<Self, TransportError> {
                match b {
                    $($code => Ok(TypeCode::$name),)*
                    other => Err(TransportError::Decode(format!("unknown message type code {other}"))),
                }
            }
        }
    };
}

type_codes! {
    ChunkFetchRequest = 0,
    RpcRequest = 1,
    StreamRequest = 2,
    OneWayMessage = 3,
    UploadStream = 4,
    ChunkFetchSuccess = 5,
    ChunkFetchFailure = 6,
    RpcResponse = 7,
    RpcFailure = 8,
    StreamResponse = 9,
    StreamFailure = 10,
}

/// A message sent client-to-server, always flowing into the request handler.
#[derive(Debug, Clone)]
pub enum RequestMessage {
    ChunkFetchRequest { stream_chunk_id: StreamChunkId },
    RpcRequest { request_id: u64, body: ManagedBuffer },
    StreamRequest { stream_id: String },
    OneWayMessage { body: ManagedBuffer },
    UploadStream { request_id: u64, meta: ManagedBuffer, data: ManagedBuffer },
}

/// A message sent server-to-client, always flowing into the response handler.
#[derive(Debug, Clone)]
pub enum ResponseMessage {
    ChunkFetchSuccess { stream_chunk_id: StreamChunkId, body: ManagedBuffer },
    ChunkFetchFailure { stream_chunk_id: StreamChunkId, error: String },
    RpcResponse { request_id: u64, body: ManagedBuffer },
    RpcFailure { request_id: u64, error: String },
    StreamResponse { stream_id: u64, byte_count: i64, body: ManagedBuffer },
    StreamFailure { stream_id: u64, error: String },
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
}

/// The header plus body split produced by [`Message::encode`]: `header` carries every
/// fixed-width field (and, for `UploadStream`, the length-prefixed `meta` buffer too),
/// while `body` is the trailing region that should be written without being copied
/// into `header` first.
pub struct EncodedMessage {
    pub header: BytesMut,
    pub body: Option<ManagedBuffer>,
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, TransportError> {
    if buf.remaining() < 4 {
        return Err(TransportError::Decode("truncated string length".into()));
    }
    let len = buf.get_i32();
    if len < 0 || (len as usize) > buf.remaining() {
        return Err(TransportError::Decode("truncated string body".into()));
    }
    let raw = buf.copy_to_bytes(len as usize);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransportError::Decode(format!("invalid utf8 in string field: {e}")))
}

fn put_stream_chunk_id(dst: &mut BytesMut, id: &StreamChunkId) {
    dst.put_i64(id.stream_id as i64);
    dst.put_i32(id.chunk_index);
}

fn get_stream_chunk_id(buf: &mut Bytes) -> Result<StreamChunkId, TransportError> {
    if buf.remaining() < 12 {
        return Err(TransportError::Decode("truncated stream-chunk id".into()));
    }
    let stream_id = buf.get_i64() as u64;
    let chunk_index = buf.get_i32();
    Ok(StreamChunkId::new(stream_id, chunk_index))
}

fn require(buf: &Bytes, n: usize, what: &str) -> Result<(), TransportError> {
    if buf.remaining() < n {
        Err(TransportError::Decode(format!("truncated {what}")))
    } else {
        Ok(())
    }
}

impl Message {
    /// Splits the message into a header (everything but the last buffer field) and an
    /// optional trailing body. `UploadStream`'s two buffers are handled by embedding
    /// its smaller `meta` buffer into the header (length-prefixed) and leaving `data`
    /// as the body, matching the "streamed sequentially" wording in the wire format.
    pub fn encode(&self) -> Result<EncodedMessage, TransportError> {
        let mut header = BytesMut::new();
        let body = match self {
            Message::Request(RequestMessage::ChunkFetchRequest { stream_chunk_id }) => {
                header.put_u8(TypeCode::ChunkFetchRequest as u8);
                put_stream_chunk_id(&mut header, stream_chunk_id);
                None
            }
            Message::Request(RequestMessage::RpcRequest { request_id, body }) => {
                header.put_u8(TypeCode::RpcRequest as u8);
                header.put_i64(*request_id as i64);
                Some(body.clone())
            }
            Message::Request(RequestMessage::StreamRequest { stream_id }) => {
                header.put_u8(TypeCode::StreamRequest as u8);
                put_string(&mut header, stream_id);
                None
            }
            Message::Request(RequestMessage::OneWayMessage { body }) => {
                header.put_u8(TypeCode::OneWayMessage as u8);
                Some(body.clone())
            }
            Message::Request(RequestMessage::UploadStream { request_id, meta, data }) => {
                header.put_u8(TypeCode::UploadStream as u8);
                header.put_i64(*request_id as i64);
                let meta_bytes = meta.as_readable_bytes()?;
                header.put_i32(meta_bytes.len() as i32);
                header.put_slice(&meta_bytes);
                Some(data.clone())
            }
            Message::Response(ResponseMessage::ChunkFetchSuccess { stream_chunk_id, body }) => {
                header.put_u8(TypeCode::ChunkFetchSuccess as u8);
                put_stream_chunk_id(&mut header, stream_chunk_id);
                Some(body.clone())
            }
            Message::Response(ResponseMessage::ChunkFetchFailure { stream_chunk_id, error }) => {
                header.put_u8(TypeCode::ChunkFetchFailure as u8);
                put_stream_chunk_id(&mut header, stream_chunk_id);
                put_string(&mut header, error);
                None
            }
            Message::Response(ResponseMessage::RpcResponse { request_id, body }) => {
                header.put_u8(TypeCode::RpcResponse as u8);
                header.put_i64(*request_id as i64);
                Some(body.clone())
            }
            Message::Response(ResponseMessage::RpcFailure { request_id, error }) => {
                header.put_u8(TypeCode::RpcFailure as u8);
                header.put_i64(*request_id as i64);
                put_string(&mut header, error);
                None
            }
            Message::Response(ResponseMessage::StreamResponse { stream_id, byte_count, body }) => {
                header.put_u8(TypeCode::StreamResponse as u8);
                header.put_i64(*stream_id as i64);
                header.put_i64(*byte_count);
                Some(body.clone())
            }
            Message::Response(ResponseMessage::StreamFailure { stream_id, error }) => {
                header.put_u8(TypeCode::StreamFailure as u8);
                header.put_i64(*stream_id as i64);
                put_string(&mut header, error);
                None
            }
        };
        Ok(EncodedMessage { header, body })
    }

    /// Decodes a fully-assembled frame payload (as handed back by [`crate::wire::frame::FrameCodec`])
    /// into a typed message. Body buffers are zero-copy slices of `payload`.
    pub fn decode(mut payload: Bytes) -> Result<Message, TransportError> {
        require(&payload, 1, "type code")?;
        let type_code = TypeCode::from_byte(payload.get_u8())?;
        match type_code {
            TypeCode::ChunkFetchRequest => {
                let stream_chunk_id = get_stream_chunk_id(&mut payload)?;
                Ok(Message::Request(RequestMessage::ChunkFetchRequest { stream_chunk_id }))
            }
            TypeCode::RpcRequest => {
                require(&payload, 8, "request id")?;
                let request_id = payload.get_i64() as u64;
                let body = ManagedBuffer::from_memory(payload);
                Ok(Message::Request(RequestMessage::RpcRequest { request_id, body }))
            }
            TypeCode::StreamRequest => {
                let stream_id = get_string(&mut payload)?;
                Ok(Message::Request(RequestMessage::StreamRequest { stream_id }))
            }
            TypeCode::OneWayMessage => {
                let body = ManagedBuffer::from_memory(payload);
                Ok(Message::Request(RequestMessage::OneWayMessage { body }))
            }
            TypeCode::UploadStream => {
                require(&payload, 8, "request id")?;
                let request_id = payload.get_i64() as u64;
                require(&payload, 4, "meta length")?;
                let meta_len = payload.get_i32();
                if meta_len < 0 || meta_len as usize > payload.remaining() {
                    return Err(TransportError::Decode("truncated upload meta buffer".into()));
                }
                let meta = ManagedBuffer::from_memory(payload.copy_to_bytes(meta_len as usize));
                let data = ManagedBuffer::from_memory(payload);
                Ok(Message::Request(RequestMessage::UploadStream { request_id, meta, data }))
            }
            TypeCode::ChunkFetchSuccess => {
                let stream_chunk_id = get_stream_chunk_id(&mut payload)?;
                let body = ManagedBuffer::from_memory(payload);
                Ok(Message::Response(ResponseMessage::ChunkFetchSuccess { stream_chunk_id, body }))
            }
            TypeCode::ChunkFetchFailure => {
                let stream_chunk_id = get_stream_chunk_id(&mut payload)?;
                let error = get_string(&mut payload)?;
                Ok(Message::Response(ResponseMessage::ChunkFetchFailure { stream_chunk_id, error }))
            }
            TypeCode::RpcResponse => {
                require(&payload, 8, "request id")?;
                let request_id = payload.get_i64() as u64;
                let body = ManagedBuffer::from_memory(payload);
                Ok(Message::Response(ResponseMessage::RpcResponse { request_id, body }))
            }
            TypeCode::RpcFailure => {
                require(&payload, 8, "request id")?;
                let request_id = payload.get_i64() as u64;
                let error = get_string(&mut payload)?;
                Ok(Message::Response(ResponseMessage::RpcFailure { request_id, error }))
            }
            TypeCode::StreamResponse => {
                require(&payload, 16, "stream id + byte count")?;
                let stream_id = payload.get_i64() as u64;
                let byte_count = payload.get_i64();
                let body = ManagedBuffer::from_memory(payload);
                Ok(Message::Response(ResponseMessage::StreamResponse { stream_id, byte_count, body }))
            }
            TypeCode::StreamFailure => {
                require(&payload, 8, "stream id")?;
                let stream_id = payload.get_i64() as u64;
                let error = get_string(&mut payload)?;
                Ok(Message::Response(ResponseMessage::StreamFailure { stream_id, error }))
            }
        }
    }
}
