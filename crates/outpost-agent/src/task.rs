//! Spawning helpers with a panic boundary per task

use std::any::Any;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tracing::error;

/// Spawn a background task whose panic is logged instead of propagated
pub fn spawn_supervised<F>(name: impl Into<String>, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let inner = tokio::spawn(future);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                error!(task = %name, "task panicked: {}", panic_message(e));
            }
        }
    })
}

/// Human readable message from a failed join
pub fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload_message(payload.as_ref()),
        Err(error) => error.to_string(),
    }
}

/// Extract the message carried by a panic payload
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
