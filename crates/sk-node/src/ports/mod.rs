//! Local port arbitration

mod probe;
mod registry;

pub use probe::{Availability, OsPortProbe, PortOwner, PortProbe};
pub use registry::PortRegistry;
