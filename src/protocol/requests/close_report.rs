use log::debug;

use crate::protocol::{
    ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, SequenceNo,
    ServerCallbackData, next_sequence_number,
};

use super::CLOSE_REPORT_REQUEST;

/// Closes the report open on this connection. Closing with nothing open is not an error.
#[derive(Debug, Default)]
pub struct CloseReportRequest {
    sequence: SequenceNo,
}

impl CloseReportRequest {
    pub fn new() -> Self {
        Self {
            sequence: next_sequence_number(),
        }
    }
}

impl NetworkRequest for CloseReportRequest {
    fn id(&self) -> RequestId {
        CLOSE_REPORT_REQUEST
    }

    fn name(&self) -> &'static str {
        "CloseReport"
    }

    fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence_number(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        if let Some(report) = data.close_report() {
            debug!("closed report '{}'", report.name());
        }
        Ok(())
    }

    fn receive_response_payload(
        &mut self,
        _rx: &mut Receiver<'_>,
        data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        data.set_report(None)
    }
}
