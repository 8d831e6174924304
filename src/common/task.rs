//! Task composition combinators
//!
//! The two-task join is the relay's primitive: request and response
//! copies run concurrently, the first error cancels the sibling, and
//! session cancellation aborts both.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::link::LinkWriter;

/// Run `a` and `b` concurrently; return when both complete.
///
/// The first error is propagated and the sibling future is dropped,
/// which unblocks a stuck copy by tearing its I/O down. Cancelling
/// `token` aborts both with [`Error::Cancelled`].
pub async fn run<A, B>(token: &CancellationToken, a: A, b: B) -> Result<()>
where
    A: Future<Output = Result<()>>,
    B: Future<Output = Result<()>>,
{
    tokio::select! {
        r = async { tokio::try_join!(a, b) } => r.map(|_| ()),
        _ = token.cancelled() => Err(Error::Cancelled),
    }
}

/// Run `then` only when `f` completes without error.
pub fn on_success<F, T>(f: F, then: T) -> impl Future<Output = Result<()>>
where
    F: Future<Output = Result<()>>,
    T: Future<Output = Result<()>>,
{
    async move {
        f.await?;
        then.await
    }
}

/// Trivial action closing the writer half of a link.
pub fn close(writer: LinkWriter) -> impl Future<Output = Result<()>> {
    async move {
        writer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::copy::MultiBufferReader;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_waits_for_both() {
        let token = CancellationToken::new();
        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        run(
            &token,
            async move {
                o1.lock().push("a");
                Ok(())
            },
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                o2.lock().push("b");
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_first_error_cancels_sibling() {
        let token = CancellationToken::new();
        let err = run(
            &token,
            async { Err(Error::MissingTarget) },
            async {
                // Would block forever; must be dropped by the join.
                futures_util::future::pending::<()>().await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MissingTarget));
    }

    #[tokio::test]
    async fn test_token_cancellation_aborts() {
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            t.cancel();
        });
        let err = run(
            &token,
            async {
                futures_util::future::pending::<()>().await;
                Ok(())
            },
            async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_on_success_and_close() {
        let (inbound, mut outbound) = crate::common::link_pair();
        let writer = inbound.writer.clone();

        run(
            &CancellationToken::new(),
            async { Ok(()) },
            on_success(async { Ok(()) }, close(writer.clone())),
        )
        .await
        .unwrap();

        assert!(writer.is_closed());
        assert!(outbound.reader.read_multi_buffer().await.unwrap().is_none());
    }
}
