pub mod agreement;
pub mod history;
pub mod shipment;
pub mod stock;

pub use agreement::TransferAgreementService;
pub use history::HistoryService;
pub use shipment::ShipmentService;
pub use stock::BoxService;
