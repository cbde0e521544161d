use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    middleware,
    routing::get,
    Router,
};
use serde::Deserialize;
use workrelay::WorkerPool;

/// Body returned, and relayed, when a request carries no usable message.
pub const DEFAULT_MESSAGE: &str = "no message sent :(";

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    message: Option<String>,
}

pub fn router(pool: Arc<WorkerPool>) -> Router {
    Router::new()
        .route("/", get(relay))
        .layer(middleware::from_fn(crate::middleware::request_id))
        .with_state(pool)
}

// GET /?message=abc
//
// Answers with the message straight away; the worker's response only shows
// up in the logs once the collector observes it.
async fn relay(
    State(pool): State<Arc<WorkerPool>>,
    params: Result<Query<MessageParams>, QueryRejection>,
) -> String {
    let message = match params {
        Ok(Query(MessageParams {
            message: Some(message),
        })) if !message.is_empty() => message,
        Ok(_) => DEFAULT_MESSAGE.to_string(),
        Err(rejection) => {
            tracing::debug!("malformed query, using default message: {rejection}");
            DEFAULT_MESSAGE.to_string()
        }
    };

    match pool.dispatch(message.clone()) {
        Ok(pid) => tracing::debug!(worker_id = pid, "dispatched message"),
        Err(err) => tracing::warn!("dispatch failed: {err}"),
    }

    message
}
