//! Service discovery: the attributes a server publishes, the nodes it
//! advertises, and the registry traits concrete backends implement.
//!
//! Backends (etcd, zookeeper) live outside this workspace; they plug in
//! through [`RegistryConnector`]. [`MemoryRegistry`] is the in-process
//! backend used by tests and local development.

pub mod memory;
pub mod registry;
pub mod types;

pub use {
    memory::{MemoryConnector, MemoryRegistry},
    registry::{DiscoveryError, Registry, RegistryConnector, RegistryKind, RegistryOptions},
    types::{Node, Service, ServiceAttr, ServiceRole, join_host_port},
};
