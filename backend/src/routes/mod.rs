//! API route definitions

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};

use crate::handlers::{agreement, shipment, stock};
use crate::middleware::auth_middleware;
use crate::AppState;

/// All API routes under /api/v1, each group behind the auth middleware
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/transfer-agreements", transfer_agreement_routes())
        .nest("/shipments", shipment_routes())
        .nest("/boxes", box_routes())
}

fn transfer_agreement_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(agreement::create_transfer_agreement))
        .route("/:id", get(agreement::get_transfer_agreement))
        .route("/:id/accept", post(agreement::accept_transfer_agreement))
        .route("/:id/reject", post(agreement::reject_transfer_agreement))
        .route("/:id/cancel", post(agreement::cancel_transfer_agreement))
        .route_layer(middleware::from_fn(auth_middleware))
}

fn shipment_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(shipment::create_shipment))
        .route("/:id", get(shipment::get_shipment))
        .route("/:id/preparing", patch(shipment::update_shipment_when_preparing))
        .route("/:id/receiving", patch(shipment::update_shipment_when_receiving))
        .route("/:id/send", post(shipment::send_shipment))
        .route("/:id/start-receiving", post(shipment::start_receiving_shipment))
        .route("/:id/cancel", post(shipment::cancel_shipment))
        .route("/:id/mark-lost", post(shipment::mark_shipment_lost))
        .route_layer(middleware::from_fn(auth_middleware))
}

fn box_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(stock::create_box))
        .route("/:label", get(stock::get_box))
        .route_layer(middleware::from_fn(auth_middleware))
}
