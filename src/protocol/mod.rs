//! Client-server request protocol.
//!
//! This module implements the protocol used between a Cube client and a Cube server to
//! query a remote performance report. A client and a server exchange typed requests and
//! responses over a single duplex connection, and several client threads may have requests
//! in flight at the same time without blocking each other.
//!
//! # Overview
//!
//! Every exchange is driven by a [`NetworkRequest`] implementation. The protocol core owns
//! framing, sequencing and dispatch; a request type only supplies its payloads and the
//! server-side processing step.
//!
//! On the client, one background thread (see [`dispatch`]) owns the receive half of the
//! connection for its whole lifetime. It reads response headers, looks up the waiting caller
//! by sequence number, reads the response payload into that caller's request and wakes it.
//!
//! On the server, each connection is served sequentially: [`create_from_stream`] reads one
//! request, [`NetworkRequest::process_request`] runs it against the open report, then
//! [`send_response`] or [`send_error_response`] answers it.
//!
//! # Binary Format
//!
//! All integers are fixed width and big-endian; strings are a `u64` byte length followed by
//! UTF-8 bytes.
//!
//! Request frame:
//!
//! | field | type |
//! |---|---|
//! | [`REQUEST_HEADER_START`] | `u32` |
//! | request id | `u32` |
//! | sequence number | `u32` |
//! | [`REQUEST_HEADER_END`] | `u32` |
//! | payload | request specific |
//! | [`REQUEST_PAYLOAD_END`] | `u32` |
//!
//! Response frames replace the request id with a [`ResponseCode`]. An error response carries
//! a single string as payload. The payload-end marker is omitted when the sender closed the
//! connection while answering.
//!
//! # Errors
//!
//! A [`NetworkError::Recoverable`] fails one request and leaves the connection usable. Anything
//! else (bad markers, I/O failures, an unrecoverable error response) kills the connection; every
//! pending and future caller on that connection observes the failure.
//!
//! # See Also
//!
//! - [`report`](crate::report): the query engine requests are processed against.
pub mod client;
pub mod dispatch;
mod error;
pub mod request;
pub mod requests;
mod response;
pub mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use client::{ClientCallbackData, ClientConnection};
pub use dispatch::{DispatchTable, PendingResponse, receive_response, receive_response_loop};
pub use error::NetworkError;
pub use request::{
    NetworkRequest, RequestCounter, RequestId, SequenceNo, UNREGISTERED, create_from_stream,
    next_sequence_number, receive_request_body, send_request,
};
pub use response::{
    ResponseCode, ResponseStatus, receive_response_data, receive_response_header,
    send_error_response, send_response,
};
pub use server::{
    CubeServer, RequestFactory, RequestRegistry, ServerCallbackData, ServerConnection,
    ShutdownHandle,
};
pub use transport::{Connection, Receiver, Sender};
pub use transport::MAX_VALUE_BYTES;

/// Datatype of the framing sentinels.
pub type Marker = u32;

/// Start of every request and response header, ASCII `CUBE`.
pub const REQUEST_HEADER_START: Marker = 0x4355_4245;

/// End of the header and start of the payload, ASCII `-CC-`.
pub const REQUEST_HEADER_END: Marker = 0x2d43_432d;

/// End of the payload.
pub const REQUEST_PAYLOAD_END: Marker = 0x4542_3543;

/// Version of the request set spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;
