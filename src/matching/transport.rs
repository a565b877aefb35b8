//! Host transport seams for replies and alerts.
//!
//! Delivery is best effort: the engine logs a failed or panicking delivery
//! and moves on to the next fired trigger.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::DeliveryError;

use super::alert::AlertPayload;

/// Sends a chat reply on behalf of a REPLY trigger.
pub trait ReplySink: Send + Sync {
    /// Deliver `text` to the channel the message came from.
    fn reply(&self, text: &str) -> Result<(), DeliveryError>;
}

impl<F> ReplySink for F
where
    F: Fn(&str) -> Result<(), DeliveryError> + Send + Sync,
{
    fn reply(&self, text: &str) -> Result<(), DeliveryError> {
        self(text)
    }
}

type BlockingAlertFn = dyn Fn(&AlertPayload) -> Result<(), DeliveryError> + Send + Sync;
type AsyncAlertFn = dyn Fn(AlertPayload) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync;

/// Receiver of ALERT payloads, either a plain function or an async one.
///
/// Async handlers are driven to completion on the matching worker thread.
#[derive(Clone)]
pub enum AlertHandler {
    /// Called inline.
    Blocking(Arc<BlockingAlertFn>),
    /// Returns a future that is awaited before the next trigger fires.
    Async(Arc<AsyncAlertFn>),
}

impl AlertHandler {
    /// Wrap a synchronous callback.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&AlertPayload) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Wrap an async callback.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(AlertPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |payload| f(payload).boxed()))
    }

    pub(crate) fn deliver(&self, payload: AlertPayload) -> Result<(), DeliveryError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Self::Blocking(f) => f(&payload),
            Self::Async(f) => futures::executor::block_on(f(payload.clone())),
        }));
        outcome.unwrap_or_else(|_| Err(DeliveryError::new("alert handler panicked")))
    }
}

impl std::fmt::Debug for AlertHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("AlertHandler::Blocking"),
            Self::Async(_) => f.write_str("AlertHandler::Async"),
        }
    }
}

pub(crate) fn send_reply(sink: &dyn ReplySink, text: &str) -> Result<(), DeliveryError> {
    panic::catch_unwind(AssertUnwindSafe(|| sink.reply(text)))
        .unwrap_or_else(|_| Err(DeliveryError::new("reply sink panicked")))
}
