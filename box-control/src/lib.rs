#![forbid(unsafe_code)]

//! Box control plane.
//!
//! * [`location`] — the whoswho index: node records, user aggregation and
//!   staleness accounting. Pure state, owned by the broker's Main stage.
//! * [`presence`] — the publishing loop that keeps root resolvers informed
//!   about this node.
//! * [`nat`] — the port-mapping coordinator (UPnP-IGD, PCP, NAT-PMP) and the
//!   on-demand probe used by the admin CLI.

pub mod location;
pub mod nat;
pub mod presence;

pub use location::{
    AddressEntry, AddressScope, AddressSource, Connectivity, LocateAnswer, LocationIndex,
    LocationRecord, LocationSummary, PortMappingState,
};
pub use nat::{MappingHandle, MappingSnapshot, NatBackend, NatError, NatState, ProbeReport};
pub use presence::{PresencePublisher, PresenceStatus};
