use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace};

use super::{
    ClientCallbackData, ClientConnection, Connection, Marker, NetworkError, REQUEST_HEADER_END,
    REQUEST_HEADER_START, REQUEST_PAYLOAD_END, Receiver, Sender, ServerCallbackData,
    ServerConnection,
};

/// Opcode selecting the concrete request type of a frame.
pub type RequestId = u32;

/// Identifies one request/response exchange, independent of its opcode.
pub type SequenceNo = u32;

/// Id reported by a request type that has no opcode.
pub const UNREGISTERED: RequestId = RequestId::MAX;

/// One RPC-style exchange between a client and a server.
///
/// The protocol core frames and sequences requests; an implementation only supplies its
/// payloads and what the server does with them. Every payload hook defaults to an empty
/// payload.
///
/// Client-side instances are created with a fresh sequence number (see
/// [`next_sequence_number`]); server-side instances come out of the
/// [`RequestRegistry`](super::RequestRegistry) and take the sequence number of the frame
/// they were read from.
pub trait NetworkRequest: Send {
    fn id(&self) -> RequestId;

    /// Human readable request name.
    fn name(&self) -> &'static str;

    fn sequence_number(&self) -> SequenceNo;

    fn set_sequence_number(&mut self, sequence: SequenceNo);

    fn is_registered(&self) -> bool {
        self.id() != UNREGISTERED
    }

    /// Client: writes the request body.
    fn send_request_payload(
        &self,
        _tx: &mut Sender<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        Ok(())
    }

    /// Server: reads the request body written by [`NetworkRequest::send_request_payload`].
    fn receive_request_payload(
        &mut self,
        _rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        Ok(())
    }

    /// Server: runs the request against the open report and keeps the result for the
    /// response.
    ///
    /// A [`NetworkError::Recoverable`] is reported back to the caller and the connection
    /// stays usable; any other error closes the connection.
    fn process_request(&mut self, _data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        Ok(())
    }

    /// Server: writes the response body.
    fn send_response_payload(
        &self,
        _tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        Ok(())
    }

    /// Client: reads the response body. Runs on the receive loop thread.
    fn receive_response_payload(
        &mut self,
        _rx: &mut Receiver<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Monotonic source of sequence numbers.
///
/// The first number handed out is `1`; `0` is left for server-side placeholders.
#[derive(Debug, Default)]
pub struct RequestCounter {
    issued: AtomicU32,
}

static GLOBAL_COUNTER: RequestCounter = RequestCounter::new();

impl RequestCounter {
    pub const fn new() -> Self {
        Self {
            issued: AtomicU32::new(0),
        }
    }

    /// Counter shared by every request constructed in this process.
    pub fn global() -> &'static RequestCounter {
        &GLOBAL_COUNTER
    }

    pub fn next(&self) -> SequenceNo {
        self.issued.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Number of sequence numbers handed out since construction or the last reset.
    pub fn issued(&self) -> SequenceNo {
        self.issued.load(Ordering::SeqCst)
    }

    /// Starts counting from `1` again.
    ///
    /// Only safe when no request from before the reset can still be in flight.
    pub fn reset(&self) {
        self.issued.store(0, Ordering::SeqCst);
    }
}

/// Next process-wide sequence number.
pub fn next_sequence_number() -> SequenceNo {
    RequestCounter::global().next()
}

/// Sends `request` to the server.
///
/// Fails immediately, without writing anything, once the connection has been declared
/// dead by the receive loop.
pub fn send_request(
    request: &dyn NetworkRequest,
    connection: &ClientConnection,
) -> Result<(), NetworkError> {
    connection.dispatch().check()?;
    write_request(request, connection.connection(), connection.callback_data())
}

/// Frames `request` onto `connection`. The send half stays locked for the whole frame.
pub(crate) fn write_request(
    request: &dyn NetworkRequest,
    connection: &Connection,
    data: &ClientCallbackData,
) -> Result<(), NetworkError> {
    let mut tx = connection.sender()?;

    tx.put(REQUEST_HEADER_START)?;
    tx.put(request.id())?;
    tx.put(request.sequence_number())?;
    tx.put(REQUEST_HEADER_END)?;

    request.send_request_payload(&mut tx, data)?;

    tx.put(REQUEST_PAYLOAD_END)?;
    tx.finish()?;

    debug!(
        "sent {} request #{}",
        request.name(),
        request.sequence_number()
    );
    Ok(())
}

/// Reads one request frame and builds the matching request object.
///
/// Malformed framing and unknown request ids are unrecoverable.
pub fn create_from_stream(
    connection: &ServerConnection,
    data: &ServerCallbackData,
) -> Result<Box<dyn NetworkRequest>, NetworkError> {
    let mut rx = connection.connection().receiver()?;

    expect_marker(&mut rx, REQUEST_HEADER_START, "request header start")?;
    let id: RequestId = rx.get()?;
    let sequence: SequenceNo = rx.get()?;
    expect_marker(&mut rx, REQUEST_HEADER_END, "request header end")?;
    trace!("request header: id {id}, sequence #{sequence}");

    let mut request = connection.create_request(id, sequence)?;
    receive_request_body(request.as_mut(), &mut rx, data)?;

    Ok(request)
}

/// Reads the request payload and the closing marker.
pub fn receive_request_body(
    request: &mut dyn NetworkRequest,
    rx: &mut Receiver<'_>,
    data: &ServerCallbackData,
) -> Result<(), NetworkError> {
    request.receive_request_payload(rx, data)?;
    expect_marker(rx, REQUEST_PAYLOAD_END, "request payload end")
}

pub(crate) fn expect_marker(
    rx: &mut Receiver<'_>,
    expected: Marker,
    position: &str,
) -> Result<(), NetworkError> {
    let marker: Marker = rx.get()?;
    if marker != expected {
        return Err(NetworkError::Unrecoverable(format!(
            "malformed frame: expected {position} marker {expected:#010x}, found {marker:#010x}"
        )));
    }
    Ok(())
}
