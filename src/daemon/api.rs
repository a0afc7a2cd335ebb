//! Built-in diagnostic API.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{Method, StatusCode};
use serde::Serialize;

use crate::server::{Handler, Server};

/// State exposed by the diagnostic endpoints.
pub(super) struct ApiState {
    pub name: String,
    pub hostname: String,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    name: String,
    hostname: String,
    uptime_seconds: u64,
    version: &'static str,
}

pub(super) fn register_api_routes(server: &mut Server, state: ApiState) {
    let state = Arc::new(state);

    server.route("/status", Method::GET, move |h: Handler| {
        let state = Arc::clone(&state);

        async move {
            let response = StatusResponse {
                name: state.name.clone(),
                hostname: state.hostname.clone(),
                uptime_seconds: state.start_time.elapsed().as_secs(),
                version: env!("CARGO_PKG_VERSION"),
            };

            h.reply_json(StatusCode::OK, &response)
        }
    });
}
