//! Service catalog controller
//!
//! Reconciles ServiceBroker, ServiceClass, ServicePlan, ServiceInstance and
//! ServiceBinding resources against Open Service Broker endpoints. Each kind
//! has its own work queue and reconciler; long-running broker operations are
//! tracked on a separate polling queue. [`ControllerManager`] wires watches,
//! queues and workers together.

pub mod binding;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod context;
pub mod core_client;
pub mod instance;
pub mod key;
pub mod manager;
pub mod memory;
pub mod poll;
pub mod resolver;
pub mod store;

mod parameters;
mod status;

#[cfg(test)]
mod test_support;

pub use binding::BindingReconciler;
pub use broker::BrokerReconciler;
pub use catalog::{ClassReconciler, PlanReconciler};
pub use config::ControllerConfig;
pub use context::{Context, ContextBuilder, Queues};
pub use instance::InstanceReconciler;
pub use key::ObjectKey;
pub use manager::ControllerManager;
pub use poll::{PollReconciler, PollTarget};
pub use store::{ResourceStore, WatchEvent};
