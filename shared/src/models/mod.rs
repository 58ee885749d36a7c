//! Domain models for the AidFlow platform

mod agreement;
mod organisation;
mod shipment;
mod stock;

pub use agreement::*;
pub use organisation::*;
pub use shipment::*;
pub use stock::*;
