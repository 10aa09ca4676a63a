use log::debug;

use crate::{
    protocol::{
        ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender,
        SequenceNo, ServerCallbackData, next_sequence_number,
    },
    report::{ReportSummary, TreeNode},
};

use super::OPEN_REPORT_REQUEST;

/// Opens a report file on the server, relative to its report root.
///
/// The response describes the report's trees; the client keeps it in its
/// [`ClientCallbackData`].
#[derive(Debug, Default)]
pub struct OpenReportRequest {
    sequence: SequenceNo,
    path: String,
    summary: Option<ReportSummary>,
}

impl OpenReportRequest {
    pub fn new(path: &str) -> Self {
        Self {
            sequence: next_sequence_number(),
            path: path.to_string(),
            summary: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn summary(&self) -> Option<&ReportSummary> {
        self.summary.as_ref()
    }
}

impl NetworkRequest for OpenReportRequest {
    fn id(&self) -> RequestId {
        OPEN_REPORT_REQUEST
    }

    fn name(&self) -> &'static str {
        "OpenReport"
    }

    fn sequence_number(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence_number(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn send_request_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        tx.put_str(&self.path)
    }

    fn receive_request_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        self.path = rx.get_string()?;
        Ok(())
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        let report = data.open_report(&self.path)?;
        self.summary = Some(report.summary());
        Ok(())
    }

    fn send_response_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        let summary = self
            .summary
            .as_ref()
            .ok_or_else(|| NetworkError::Unrecoverable("report was not opened".into()))?;

        tx.put_str(&summary.name)?;
        tx.put(&summary.metrics)?;
        tx.put(&summary.cnodes)?;
        tx.put(&summary.sysres)
    }

    fn receive_response_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        let summary = ReportSummary {
            name: rx.get_string()?,
            metrics: rx.get::<Vec<TreeNode>>()?,
            cnodes: rx.get::<Vec<TreeNode>>()?,
            sysres: rx.get::<Vec<TreeNode>>()?,
        };
        debug!(
            "remote report '{}': {} metrics, {} cnodes, {} system resources",
            summary.name,
            summary.metrics.len(),
            summary.cnodes.len(),
            summary.sysres.len()
        );

        data.set_report(Some(summary.clone()))?;
        self.summary = Some(summary);
        Ok(())
    }
}
