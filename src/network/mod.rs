//! Host-side networking for guests: tap devices and guest addressing.

pub mod tap;
pub mod types;

pub use tap::Tap;
pub use types::{mac_from_ip, NetIfaceConfig};
