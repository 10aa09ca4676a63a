use log::{debug, trace};

use super::{
    ClientCallbackData, NetworkError, NetworkRequest, REQUEST_HEADER_END, REQUEST_HEADER_START,
    REQUEST_PAYLOAD_END, Receiver, SequenceNo, ServerCallbackData, ServerConnection,
    request::expect_marker,
};

/// Acknowledgement carried in place of the request id in a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Payload is the request specific response body.
    Ok,
    /// The request failed; the payload is an error message.
    RecoverableError,
    /// The server gave up on the connection; the payload is an error message.
    UnrecoverableError,
}

impl From<ResponseCode> for u32 {
    fn from(value: ResponseCode) -> Self {
        match value {
            ResponseCode::Ok => 0,
            ResponseCode::RecoverableError => 1,
            ResponseCode::UnrecoverableError => 2,
        }
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = NetworkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Ok),
            1 => Ok(ResponseCode::RecoverableError),
            2 => Ok(ResponseCode::UnrecoverableError),
            code => Err(NetworkError::Unrecoverable(format!(
                "malformed response header: unknown response code {code}"
            ))),
        }
    }
}

/// Outcome of reading a response header on the client.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    /// A response body for `sequence` follows.
    Ok(SequenceNo),
    /// The request `sequence` failed; its frame has been read completely.
    Failed {
        sequence: SequenceNo,
        message: String,
    },
}

/// Answers `request` with its response payload.
///
/// The payload-end marker is skipped when the payload itself closed the connection.
pub fn send_response(
    request: &dyn NetworkRequest,
    connection: &ServerConnection,
    data: &ServerCallbackData,
) -> Result<(), NetworkError> {
    let mut tx = connection.connection().sender()?;

    tx.put(REQUEST_HEADER_START)?;
    tx.put(u32::from(ResponseCode::Ok))?;
    tx.put(request.sequence_number())?;
    tx.put(REQUEST_HEADER_END)?;

    request.send_response_payload(&mut tx, data)?;

    if tx.is_established() {
        tx.put(REQUEST_PAYLOAD_END)?;
    }
    tx.finish()?;

    debug!(
        "answered {} request #{}",
        request.name(),
        request.sequence_number()
    );
    Ok(())
}

/// Answers `request` with an error message instead of its response payload.
pub fn send_error_response(
    request: &dyn NetworkRequest,
    connection: &ServerConnection,
    code: ResponseCode,
    message: &str,
) -> Result<(), NetworkError> {
    write_error_response(connection, request.sequence_number(), code, message)
}

pub(crate) fn write_error_response(
    connection: &ServerConnection,
    sequence: SequenceNo,
    code: ResponseCode,
    message: &str,
) -> Result<(), NetworkError> {
    let mut tx = connection.connection().sender()?;

    tx.put(REQUEST_HEADER_START)?;
    tx.put(u32::from(code))?;
    tx.put(sequence)?;
    tx.put(REQUEST_HEADER_END)?;
    tx.put_str(message)?;

    if tx.is_established() {
        tx.put(REQUEST_PAYLOAD_END)?;
    }
    tx.finish()?;

    debug!("sent {code:?} for request #{sequence}: {message}");
    Ok(())
}

/// Reads the next response header.
///
/// Recoverable error frames are consumed completely and reported as
/// [`ResponseStatus::Failed`]. An unrecoverable error response is returned as `Err`.
pub fn receive_response_header(rx: &mut Receiver<'_>) -> Result<ResponseStatus, NetworkError> {
    expect_marker(rx, REQUEST_HEADER_START, "response header start")?;
    let code = ResponseCode::try_from(rx.get::<u32>()?)?;
    let sequence: SequenceNo = rx.get()?;
    expect_marker(rx, REQUEST_HEADER_END, "response header end")?;
    trace!("response header: {code:?}, sequence #{sequence}");

    match code {
        ResponseCode::Ok => Ok(ResponseStatus::Ok(sequence)),
        ResponseCode::RecoverableError => {
            let message = rx.get_string()?;
            if rx.is_established() {
                expect_marker(rx, REQUEST_PAYLOAD_END, "error payload end")?;
            }
            Ok(ResponseStatus::Failed { sequence, message })
        }
        ResponseCode::UnrecoverableError => {
            let message = rx.get_string()?;
            Err(NetworkError::Unrecoverable(message))
        }
    }
}

/// Reads the response body of `request` and the closing marker.
pub fn receive_response_data(
    request: &mut dyn NetworkRequest,
    rx: &mut Receiver<'_>,
    data: &ClientCallbackData,
) -> Result<(), NetworkError> {
    request.receive_response_payload(rx, data)?;

    if rx.is_established() {
        expect_marker(rx, REQUEST_PAYLOAD_END, "response payload end")?;
    }
    Ok(())
}
