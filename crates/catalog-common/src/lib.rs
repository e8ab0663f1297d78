//! Common types for the service catalog: CRDs, conditions, errors and telemetry

#![warn(missing_docs)]

pub mod checksum;
pub mod condition;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod reason;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer token the controller places on brokers, instances and bindings
pub const FINALIZER: &str = "servicecatalog.k8s.io/controller";

/// Name the controller reports as on events
pub const CONTROLLER_NAME: &str = "service-catalog-controller";
