use crate::protocol::{
    ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender, SequenceNo,
    ServerCallbackData, next_sequence_number,
};

use super::DISCONNECT_REQUEST;

/// Ends the session. Both ends close the connection right after the response header,
/// so the response frame carries no payload-end marker.
#[derive(Debug, Default)]
pub struct DisconnectRequest {
    sequence: SequenceNo,
}

impl DisconnectRequest {
    pub fn new() -> Self {
        Self {
            sequence: next_sequence_number(),
        }
    }
}

impl NetworkRequest for DisconnectRequest {
    fn id(&self) -> RequestId {
        DISCONNECT_REQUEST
    }

    fn name(&self) -> &'static str {
        "Disconnect"
    }

    fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence_number(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        data.close_report();
        Ok(())
    }

    fn send_response_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        tx.disconnect()
    }

    fn receive_response_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        rx.disconnect();
        data.set_report(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{
        Connection, RequestRegistry, ResponseStatus, ServerConnection, receive_response_data,
        receive_response_header, send_response, transport::testing::SharedBuffer,
    };

    #[test]
    fn response_frame_has_no_payload_end() {
        let buffer = SharedBuffer::default();
        let server = ServerConnection::new(
            Connection::from_parts(buffer.clone(), buffer.clone()),
            Arc::new(RequestRegistry::protocol().unwrap()),
        );
        let request = DisconnectRequest::new();

        send_response(&request, &server, &ServerCallbackData::default()).unwrap();

        assert_eq!(buffer.len(), 16);
        assert!(!server.connection().is_established());
    }

    #[test]
    fn client_closes_after_header() {
        let buffer = SharedBuffer::default();
        let server = ServerConnection::new(
            Connection::from_parts(buffer.clone(), buffer.clone()),
            Arc::new(RequestRegistry::protocol().unwrap()),
        );
        let request = DisconnectRequest::new();
        send_response(&request, &server, &ServerCallbackData::default()).unwrap();

        let client = Connection::from_parts(buffer.clone(), buffer.clone());
        let mut rx = client.receiver().unwrap();
        assert_eq!(
            receive_response_header(&mut rx).unwrap(),
            ResponseStatus::Ok(request.sequence_number())
        );

        let mut received = DisconnectRequest::default();
        receive_response_data(&mut received, &mut rx, &ClientCallbackData::default()).unwrap();
        assert!(!rx.is_established());
        drop(rx);
        assert_eq!(buffer.len(), 0);
    }
}
