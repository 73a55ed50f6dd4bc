//! Work dispatching: endpoint selection and batch coordination.
//!
//! - `selector`: orders eligible endpoints for one item and enforces the
//!   global concurrency cap and minimum inter-request interval
//! - `batch`: chunks a work set, fans chunks out with bounded
//!   concurrency, and drives the immediate retry passes

pub mod batch;
pub mod selector;

pub use batch::{BatchCoordinator, BatchSummary};
pub use selector::{DispatchOutcome, EndpointSelector};
