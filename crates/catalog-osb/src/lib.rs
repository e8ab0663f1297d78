//! Open Service Broker client abstraction for the service catalog controller
//!
//! The controller never speaks HTTP directly. It talks to brokers through the
//! [`BrokerClient`] trait, obtaining one client per broker from a
//! [`BrokerClientFactory`]. The wire protocol lives behind those traits.
//!
//! [`fake::FakeBrokerClient`] is an in-process broker with scripted responses.

pub mod client;
pub mod error;
pub mod fake;
pub mod types;

pub use client::{AuthConfig, BrokerClient, BrokerClientFactory, ClientConfiguration};
pub use error::{BrokerError, HttpError};
pub use types::*;
