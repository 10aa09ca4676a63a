use std::fmt;

use super::ReportError;

/// Type tag sent in front of every value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Double,
    Uint64,
    Int64,
}

impl From<DataType> for u32 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Double => 0,
            DataType::Uint64 => 1,
            DataType::Int64 => 2,
        }
    }
}

impl TryFrom<u32> for DataType {
    type Error = ReportError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::Double),
            1 => Ok(DataType::Uint64),
            2 => Ok(DataType::Int64),
            other => Err(ReportError::UnknownDataType(other)),
        }
    }
}

/// A single severity value as computed by the query engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Double(f64),
    Uint64(u64),
    Int64(i64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Double(_) => DataType::Double,
            Value::Uint64(_) => DataType::Uint64,
            Value::Int64(_) => DataType::Int64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Double(v) => v,
            Value::Uint64(v) => v as f64,
            Value::Int64(v) => v as f64,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
        }
    }
}
