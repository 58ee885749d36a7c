pub mod agreement;
pub mod shipment;
pub mod stock;
