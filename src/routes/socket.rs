use crate::ws::{self, SocketDeps};
use rocket::{get, State};
use std::sync::Arc;

#[get("/socket")]
pub async fn socket(ws: rocket_ws::WebSocket, deps: &State<Arc<SocketDeps>>) -> rocket_ws::Channel<'static> {
    ws::run_connection(ws, deps.inner().clone()).await
}
