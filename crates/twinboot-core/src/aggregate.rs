//! Concurrent per-entity status collection
//!
//! One slow or failing entity never hides the others: every requested id
//! gets an entry, built by `on_error` when its call fails or panics.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::CoreError;

/// Run `status_fn` for every id concurrently and collect one entry per id
///
/// Dropping the returned future aborts the calls still in flight.
pub async fn fan_out<T, F, Fut, E>(
    ids: impl IntoIterator<Item = String>,
    status_fn: F,
    on_error: E,
) -> BTreeMap<String, T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    E: Fn(&str, String) -> T,
{
    let ids: BTreeSet<String> = ids.into_iter().collect();
    let mut calls = JoinSet::new();
    for id in &ids {
        let call = status_fn(id.clone());
        let id = id.clone();
        calls.spawn(async move { (id, AssertUnwindSafe(call).catch_unwind().await) });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = calls.join_next().await {
        let (id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "status call aborted");
                continue;
            }
        };
        let entry = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(entity = %id, error = %e, "status call failed");
                on_error(&id, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(entity = %id, error = %message, "status call panicked");
                on_error(&id, format!("status check panicked: {message}"))
            }
        };
        results.insert(id, entry);
    }

    for id in ids {
        if !results.contains_key(&id) {
            let entry = on_error(&id, "status call aborted".to_string());
            results.insert(id, entry);
        }
    }
    results
}

/// Text carried by a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
