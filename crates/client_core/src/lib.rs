//! Client side of the Durable Functions monitor: the orchestrations list
//! controller, its backend transport and the local backend process.

pub mod backend_process;
pub mod cancel;
pub mod error;
pub mod orchestrations;
pub mod query;
pub mod settings;
pub mod storage_auth;
pub mod time;
pub mod transport;

pub use backend_process::{BackendProcess, BackendProcessError};
pub use cancel::CancelToken;
pub use error::BackendError;
pub use orchestrations::{OrchestrationsEvent, OrchestrationsState, NO_FILTER_COLUMN};
pub use query::{OrchestrationsQuery, QueryError, PAGE_SIZE};
pub use settings::{load_settings, MonitorSettings};
pub use time::TimeBound;
pub use transport::{BackendClient, HttpBackendClient};
