//! RouterOS client for hotspotd.
//!
//! [`RouterApi`] is the typed surface the rest of the system uses: hotspot
//! users, IP bindings, DHCP leases, address-lists, hotspot hosts and active
//! sessions. It is implemented once by [`RouterClient`] over a [`Transport`],
//! with two transports:
//!
//! - [`RestTransport`]: RouterOS v7 REST API, bounded pool, health check on acquire
//! - [`MemoryTransport`]: in-process router for dry runs and tests

pub mod client;
pub mod duration;
pub mod error;
pub mod memory;
pub mod pool;
pub mod rest;
pub mod transport;
pub mod types;

pub use client::{MemoryRouter, RouterApi, RouterClient};
pub use error::{Result, RouterError};
pub use memory::MemoryTransport;
pub use rest::{RestConfig, RestTransport};
pub use transport::Transport;
pub use types::{
    ActiveSession, AddressEntrySpec, AddressListEntry, BindingSpec, BindingType, Change,
    DhcpLease, HotspotHost, HotspotUser, IpBinding, LeaseSpec, Record, UserSpec, paths,
};

/// Router speaking the REST API.
pub type RestRouter = RouterClient<RestTransport>;
