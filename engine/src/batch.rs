//! All-settled batch execution.
//!
//! Runs a set of independent fallible tasks concurrently and collects every
//! outcome. One task failing never cancels its siblings.

use futures::future::join_all;
use std::future::Future;

/// The outcome of one task in a batch, tagged with its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<K, T, E> {
    pub key: K,
    pub outcome: Result<T, E>,
}

impl<K, T, E> Settled<K, T, E> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Await every task and return the outcomes in input order.
pub async fn settle_all<K, T, E, F, I>(tasks: I) -> Vec<Settled<K, T, E>>
where
    I: IntoIterator<Item = (K, F)>,
    F: Future<Output = Result<T, E>>,
{
    join_all(
        tasks
            .into_iter()
            .map(|(key, task)| async move {
                Settled {
                    key,
                    outcome: task.await,
                }
            }),
    )
    .await
}
