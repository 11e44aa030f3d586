//! Blocking adapter.
//!
//! Blocking calls drive the async path on a small process-wide runtime. Calling
//! one from a thread that is already inside a tokio runtime would stall that
//! runtime's worker, so it is refused with
//! [`Error::BlockingInAsyncContext`](crate::Error::BlockingInAsyncContext).

use std::future::Future;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

use crate::error::{Error, Result};

static RUNTIME: Lazy<std::io::Result<Runtime>> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("mssql-blocking")
        .enable_all()
        .build()
});

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| Error::Io(Arc::new(std::io::Error::new(e.kind(), e.to_string()))))
}

/// Run `future` to completion on the calling thread.
pub(crate) fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::BlockingInAsyncContext);
    }
    runtime()?.block_on(future)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_outside_runtime() {
        let value = block_on(async {
            tokio::task::yield_now().await;
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_refused_inside_runtime() {
        let result = block_on(async { Ok(()) });
        assert!(matches!(result, Err(Error::BlockingInAsyncContext)));
    }
}
