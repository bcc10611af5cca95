//! Listener trait and failure isolation.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for listeners.
pub type ListenerResult = Result<(), ListenerError>;

/// Future type for async listeners.
pub type ListenerFuture = Pin<Box<dyn Future<Output = ListenerResult> + Send>>;

/// A callback invoked for every event or job delivered on a name.
///
/// Closures `Fn(T) -> impl Future<Output = ListenerResult>` implement this
/// trait, so most callers never implement it by hand.
pub trait Listener<T>: Send + Sync + 'static {
    fn handle(&self, item: T) -> ListenerFuture;
}

impl<T, F, Fut> Listener<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    fn handle(&self, item: T) -> ListenerFuture {
        Box::pin(self(item))
    }
}

/// Why a single listener invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum ListenerFailure {
    #[error("listener returned an error: {0}")]
    Error(ListenerError),

    #[error("listener panicked: {0}")]
    Panic(String),
}

/// Run one listener, capturing both returned errors and panics.
pub(crate) async fn invoke<T: Send + 'static>(
    listener: Arc<dyn Listener<T>>,
    item: T,
) -> Result<(), ListenerFailure> {
    let outcome = AssertUnwindSafe(async move { listener.handle(item).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ListenerFailure::Error(e)),
        Err(panic) => Err(ListenerFailure::Panic(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
