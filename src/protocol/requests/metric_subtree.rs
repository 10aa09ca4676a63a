use log::trace;

use crate::{
    protocol::{
        ClientCallbackData, NetworkError, NetworkRequest, Receiver, RequestId, Sender,
        SequenceNo, ServerCallbackData, next_sequence_number,
    },
    report::{NodeId, Selection, SubtreeValues, Value},
};

use super::{
    METRIC_SUBTREE_VALUES_REQUEST, receive_selections, receive_value, send_selections,
    send_value,
};

/// Values of the metrics below one root metric, down to a given depth.
///
/// Inclusive and exclusive values are only transferred when asked for; the metric ids
/// always are.
#[derive(Debug, Default)]
pub struct MetricSubtreeValuesRequest {
    sequence: SequenceNo,
    cnodes: Vec<Selection>,
    sysres: Vec<Selection>,
    root: NodeId,
    depth: u64,
    want_inclusive: bool,
    want_exclusive: bool,
    values: SubtreeValues,
}

impl MetricSubtreeValuesRequest {
    pub fn new(
        cnodes: Vec<Selection>,
        sysres: Vec<Selection>,
        root: NodeId,
        depth: u64,
    ) -> Self {
        Self {
            sequence: next_sequence_number(),
            cnodes,
            sysres,
            root,
            depth,
            want_inclusive: true,
            want_exclusive: true,
            values: SubtreeValues::default(),
        }
    }

    /// Restricts the response to the given value kinds.
    pub fn with_flavours(mut self, inclusive: bool, exclusive: bool) -> Self {
        self.want_inclusive = inclusive;
        self.want_exclusive = exclusive;
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn metric_ids(&self) -> &[NodeId] {
        &self.values.ids
    }

    /// Empty unless inclusive values were requested.
    pub fn inclusive_values(&self) -> &[Value] {
        &self.values.inclusive
    }

    /// Empty unless exclusive values were requested.
    pub fn exclusive_values(&self) -> &[Value] {
        &self.values.exclusive
    }

    pub fn into_values(self) -> SubtreeValues {
        self.values
    }
}

impl NetworkRequest for MetricSubtreeValuesRequest {
    fn id(&self) -> RequestId {
        METRIC_SUBTREE_VALUES_REQUEST
    }

    fn name(&self) -> &'static str {
        "MetricSubtreeValues"
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
        send_selections(tx, &self.cnodes)?;
        send_selections(tx, &self.sysres)?;
        tx.put(self.root)?;
        tx.put(self.depth)?;
        tx.put(u8::from(self.want_inclusive))?;
        tx.put(u8::from(self.want_exclusive))
    }

    fn receive_request_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        self.cnodes = receive_selections(rx)?;
        self.sysres = receive_selections(rx)?;
        self.root = rx.get()?;
        self.depth = rx.get()?;
        self.want_inclusive = rx.get::<u8>()? != 0;
        self.want_exclusive = rx.get::<u8>()? != 0;
        Ok(())
    }

    fn process_request(&mut self, data: &mut ServerCallbackData) -> Result<(), NetworkError> {
        let mut values = data.report()?.metric_subtree_values(
            &self.cnodes,
            &self.sysres,
            self.root,
            self.depth,
        )?;
        if !self.want_inclusive {
            values.inclusive.clear();
        }
        if !self.want_exclusive {
            values.exclusive.clear();
        }
        self.values = values;
        Ok(())
    }

    fn send_response_payload(
        &self,
        tx: &mut Sender<'_>,
        _data: &ServerCallbackData,
    ) -> Result<(), NetworkError> {
        let ids = &self.values.ids;
        tx.put(ids.len() as u64)?;
        for (index, &id) in ids.iter().enumerate() {
            tx.put(id)?;
            tx.put(index as u64)?;
        }

        for (wanted, values) in [
            (self.want_inclusive, &self.values.inclusive),
            (self.want_exclusive, &self.values.exclusive),
        ] {
            if !wanted {
                continue;
            }
            if values.len() != ids.len() {
                return Err(NetworkError::Unrecoverable(format!(
                    "{} values for {} metrics",
                    values.len(),
                    ids.len()
                )));
            }
            for value in values {
                send_value(tx, value)?;
            }
        }
        Ok(())
    }

    fn receive_response_payload(
        &mut self,
        rx: &mut Receiver<'_>,
        _data: &ClientCallbackData,
    ) -> Result<(), NetworkError> {
        let count: u64 = rx.get()?;

        let mut values = SubtreeValues::default();
        for position in 0..count {
            let id: NodeId = rx.get()?;
            let index: u64 = rx.get()?;
            if index != position {
                return Err(NetworkError::Unrecoverable(format!(
                    "malformed subtree response: metric {id} at index {index}, expected {position}"
                )));
            }
            values.ids.push(id);
        }

        if self.want_inclusive {
            for _ in 0..count {
                values.inclusive.push(receive_value(rx)?);
            }
        }
        if self.want_exclusive {
            for _ in 0..count {
                values.exclusive.push(receive_value(rx)?);
            }
        }
        trace!("received values of {count} metrics below metric {}", self.root);

        self.values = values;
        Ok(())
    }
}
