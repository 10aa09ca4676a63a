pub mod protocol;
pub mod report;

pub use protocol::{ClientConnection, CubeServer, NetworkError, NetworkRequest};
pub use report::{CalculationFlavour, Report, ReportError, ReportSummary, Value};
