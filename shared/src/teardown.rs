//! LIFO teardown stack for ordered shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::warn;

use crate::Result;

/// A single teardown callback. Teardowns outlive the function scope that
/// created them, so they are stored as boxed closures rather than guards.
pub type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Stack of teardown callbacks, executed in reverse push order.
#[derive(Default)]
pub struct TeardownStack {
    funcs: Mutex<Vec<(&'static str, TeardownFn)>>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown to run before all previously pushed ones.
    pub fn push(&self, component: &'static str, f: TeardownFn) {
        self.funcs.lock().unwrap().push((component, f));
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.lock().unwrap().is_empty()
    }

    /// Run every teardown, last pushed first. Each callback is best-effort:
    /// errors and panics are logged and do not stop the remainder.
    pub async fn teardown(&self) {
        let funcs = std::mem::take(&mut *self.funcs.lock().unwrap());
        for (component, f) in funcs.into_iter().rev() {
            match AssertUnwindSafe(f()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(component, error = %e, "teardown.error"),
                Err(_) => warn!(component, "teardown.panic"),
            }
        }
    }
}
