//! Primary and secondary relays for name-addressed events across
//! isolated contexts.
//!
//! Provides:
//! - `PrimaryRelay` - Routing table owner and single ingress/egress point
//! - `SecondaryRelay` - Per-context mirror that only talks to the primary
//! - Log forwarding from secondaries to the primary

pub mod error;
pub mod logs;
pub mod pipeline;
pub mod primary;
pub mod routing;
pub mod secondary;

pub use error::RelayError;
pub use primary::{PrimaryEvent, PrimaryRelay};
pub use routing::RoutingTable;
pub use secondary::{SecondaryRelay, SendOptions};
