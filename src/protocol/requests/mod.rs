//! The request types spoken by Cube clients and servers.
//!
//! Every type here reports a fixed opcode from [`NetworkRequest::id`]; [`register_all`]
//! makes them known to a server's [`RequestRegistry`].
use log::debug;

use crate::report::{CalculationFlavour, DataType, Selection, Value};

use super::{NetworkError, NetworkRequest, Receiver, RequestId, RequestRegistry, Sender};

mod callpath_tree;
mod close_report;
mod disconnect;
mod metric_subtree;
mod metric_tree;
mod open_report;
mod system_tree;
mod version;

pub use callpath_tree::CallpathTreeValuesRequest;
pub use close_report::CloseReportRequest;
pub use disconnect::DisconnectRequest;
pub use metric_subtree::MetricSubtreeValuesRequest;
pub use metric_tree::MetricTreeValuesRequest;
pub use open_report::OpenReportRequest;
pub use system_tree::SystemTreeValuesRequest;
pub use version::{VersionRequest, library_version};

pub const VERSION_REQUEST: RequestId = 0;
pub const OPEN_REPORT_REQUEST: RequestId = 1;
pub const CLOSE_REPORT_REQUEST: RequestId = 2;
pub const METRIC_TREE_VALUES_REQUEST: RequestId = 3;
pub const SYSTEM_TREE_VALUES_REQUEST: RequestId = 4;
pub const DISCONNECT_REQUEST: RequestId = 5;
pub const CALLPATH_TREE_VALUES_REQUEST: RequestId = 6;
pub const METRIC_SUBTREE_VALUES_REQUEST: RequestId = 7;

/// Constructor of an empty server-side instance of `R`.
pub fn factory<R>() -> Box<dyn NetworkRequest>
where
    R: NetworkRequest + Default + 'static,
{
    Box::new(R::default())
}

/// Registers every request type of the protocol.
pub fn register_all(registry: &mut RequestRegistry) -> Result<(), NetworkError> {
    registry.register(factory::<VersionRequest>)?;
    registry.register(factory::<OpenReportRequest>)?;
    registry.register(factory::<CloseReportRequest>)?;
    registry.register(factory::<MetricTreeValuesRequest>)?;
    registry.register(factory::<SystemTreeValuesRequest>)?;
    registry.register(factory::<DisconnectRequest>)?;
    registry.register(factory::<CallpathTreeValuesRequest>)?;
    registry.register(factory::<MetricSubtreeValuesRequest>)?;

    debug!("registered {} request types", registry.len());
    Ok(())
}

pub(crate) fn send_selections(
    tx: &mut Sender<'_>,
    selections: &[Selection],
) -> Result<(), NetworkError> {
    let count = u32::try_from(selections.len()).map_err(|_| {
        NetworkError::Recoverable(format!("too many selections: {}", selections.len()))
    })?;

    tx.put(count)?;
    for &(id, flavour) in selections {
        tx.put(id)?;
        tx.put(u8::from(flavour))?;
    }
    Ok(())
}

pub(crate) fn receive_selections(rx: &mut Receiver<'_>) -> Result<Vec<Selection>, NetworkError> {
    let count: u32 = rx.get()?;

    let mut selections = Vec::new();
    for _ in 0..count {
        let id: u32 = rx.get()?;
        let flavour = CalculationFlavour::try_from(rx.get::<u8>()?)
            .map_err(|err| NetworkError::Unrecoverable(format!("malformed selection: {err}")))?;
        selections.push((id, flavour));
    }
    Ok(selections)
}

/// Writes `n`, then `n` inclusive and `n` exclusive values.
pub(crate) fn send_values(
    tx: &mut Sender<'_>,
    inclusive: &[Value],
    exclusive: &[Value],
) -> Result<(), NetworkError> {
    if inclusive.len() != exclusive.len() {
        return Err(NetworkError::Unrecoverable(format!(
            "{} inclusive but {} exclusive values",
            inclusive.len(),
            exclusive.len()
        )));
    }

    tx.put(inclusive.len() as u64)?;
    for value in inclusive.iter().chain(exclusive) {
        send_value(tx, value)?;
    }
    Ok(())
}

pub(crate) fn receive_values(
    rx: &mut Receiver<'_>,
) -> Result<(Vec<Value>, Vec<Value>), NetworkError> {
    let count: u64 = rx.get()?;

    let mut inclusive = Vec::new();
    for _ in 0..count {
        inclusive.push(receive_value(rx)?);
    }
    let mut exclusive = Vec::new();
    for _ in 0..count {
        exclusive.push(receive_value(rx)?);
    }
    Ok((inclusive, exclusive))
}

fn send_value(tx: &mut Sender<'_>, value: &Value) -> Result<(), NetworkError> {
    tx.put(u32::from(value.data_type()))?;
    match *value {
        Value::Double(v) => tx.put(v),
        Value::Uint64(v) => tx.put(v),
        Value::Int64(v) => tx.put(v),
    }
}

fn receive_value(rx: &mut Receiver<'_>) -> Result<Value, NetworkError> {
    let data_type = DataType::try_from(rx.get::<u32>()?)
        .map_err(|err| NetworkError::Unrecoverable(format!("malformed value: {err}")))?;

    Ok(match data_type {
        DataType::Double => Value::Double(rx.get()?),
        DataType::Uint64 => Value::Uint64(rx.get()?),
        DataType::Int64 => Value::Int64(rx.get()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Connection, transport::testing::SharedBuffer};

    #[test]
    fn protocol_registry_knows_every_opcode() {
        let registry = RequestRegistry::protocol().unwrap();

        assert_eq!(registry.len(), 8);
        for id in [
            VERSION_REQUEST,
            OPEN_REPORT_REQUEST,
            CLOSE_REPORT_REQUEST,
            METRIC_TREE_VALUES_REQUEST,
            SYSTEM_TREE_VALUES_REQUEST,
            DISCONNECT_REQUEST,
            CALLPATH_TREE_VALUES_REQUEST,
            METRIC_SUBTREE_VALUES_REQUEST,
        ] {
            assert!(registry.contains(id), "missing request id {id}");
            assert_eq!(registry.create(id, 9).unwrap().id(), id);
        }
    }

    #[test]
    fn selection_layout() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());

        let mut tx = connection.sender().unwrap();
        send_selections(&mut tx, &[(7, CalculationFlavour::Exclusive)]).unwrap();
        tx.finish().unwrap();

        assert_eq!(buffer.contents(), vec![0, 0, 0, 1, 0, 0, 0, 7, 1]);
    }

    #[test]
    fn unknown_flavour_is_malformed() {
        let buffer = SharedBuffer::default();
        buffer.replace(&[0, 0, 0, 1, 0, 0, 0, 7, 9]);
        let connection = Connection::from_parts(buffer.clone(), buffer);

        let mut rx = connection.receiver().unwrap();
        assert!(matches!(
            receive_selections(&mut rx),
            Err(NetworkError::Unrecoverable(ref msg)) if msg.contains("malformed")
        ));
    }

    #[test]
    fn mixed_value_types_keep_their_tags() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());
        let inclusive = vec![Value::Uint64(4), Value::Int64(-1)];
        let exclusive = vec![Value::Double(0.25), Value::Uint64(0)];

        let mut tx = connection.sender().unwrap();
        send_values(&mut tx, &inclusive, &exclusive).unwrap();
        tx.finish().unwrap();

        // count, then four tagged 8 byte values
        assert_eq!(buffer.len(), 8 + 4 * (4 + 8));

        let mut rx = connection.receiver().unwrap();
        assert_eq!(receive_values(&mut rx).unwrap(), (inclusive, exclusive));
    }

    #[test]
    fn unbalanced_values_are_refused() {
        let buffer = SharedBuffer::default();
        let connection = Connection::from_parts(buffer.clone(), buffer.clone());

        let mut tx = connection.sender().unwrap();
        assert!(send_values(&mut tx, &[Value::Double(1.0)], &[]).is_err());
    }
}
