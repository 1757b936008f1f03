use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;

use super::handler::handle_socket;
use super::GatewayState;

pub fn create_router(_state: Arc<GatewayState>) -> Router<Arc<GatewayState>> {
    Router::new().route("/", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
