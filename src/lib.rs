//! unitgate - TCP to MQTT unit gateway
//!
//! Backends send JSON commands over TCP addressed to a device unit; the
//! gateway publishes them on the unit's MQTT command topic and routes the
//! device replies back to the Backend connection that owns the unit.

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod service;
pub mod topic;

pub use bus::{BusClient, BusError, BusEvent, BusEventLoop, BusStatus};
pub use command::{Command, CommandType};
pub use config::Config;
pub use dispatcher::ReplyDispatcher;
pub use error::GatewayError;
pub use gateway::GatewayServer;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::{CommandRouter, Publisher};
pub use service::Service;
pub use topic::TopicScheme;
