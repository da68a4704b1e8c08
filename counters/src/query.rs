//! Grouped sums over the local registry.
//!
//! A query selects every instrument with a given name, projects its tags onto
//! the requested keys and sums the instruments' values per distinct tuple of
//! tag values. Instruments lacking a requested key belong to no group. With
//! no keys every matching instrument lands in the single empty-tuple group.
//!
//! The value an instrument contributes is fixed per kind: a counter its
//! current interval delta, a gauge its last value, a meter its mark count and
//! a timer or histogram its sample count.
//!
//! Queries run as tasks on the engine's runtime, yielding between registry
//! shards, and are read only. Only this process's measurements are visible,
//! never values aggregated by a backend.

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    runtime::Handle,
    task::{self, JoinHandle},
};
use tracing::debug;

use crate::{error::Error, registry::Registry};

/// Result of a sum query: ordered tuple of tag values to summed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedSums {
    groups: BTreeMap<Vec<String>, f64>,
}

impl GroupedSums {
    /// Sum for the group whose tag values are `values`, positionally matched
    /// to the query's keys.
    #[must_use]
    pub fn get<S: AsRef<str>>(&self, values: &[S]) -> Option<f64> {
        let key: Vec<String> = values.iter().map(|v| v.as_ref().to_owned()).collect();
        self.groups.get(&key).copied()
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no instrument matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterate groups in lexicographic order of their tag values.
    pub fn iter(&self) -> impl Iterator<Item = (&[String], f64)> {
        self.groups.iter().map(|(k, v)| (k.as_slice(), *v))
    }

    /// Consume into the underlying map.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<Vec<String>, f64> {
        self.groups
    }
}

/// Sum shard by shard, yielding to the runtime between shards so a large
/// registry does not monopolize a worker. No shard lock is held across a
/// yield.
pub(crate) async fn grouped_sums(
    registry: &Registry,
    name: &str,
    keys: &[String],
) -> BTreeMap<Vec<String>, f64> {
    let mut groups = BTreeMap::new();
    for shard in 0..registry.shard_count() {
        registry.sum_shard_into(shard, name, keys, &mut groups);
        task::yield_now().await;
    }
    groups
}

#[derive(Debug)]
enum State {
    Running(JoinHandle<GroupedSums>),
    Ready(Option<Error>),
}

/// Deferred result of [`crate::Engine::sum_query`].
///
/// Await it for the result. Dropping the handle detaches the query; call
/// [`QueryHandle::cancel`] to abort it, after which awaiting yields
/// [`Error::QueryCancelled`].
#[derive(Debug)]
#[must_use = "a query does nothing useful unless awaited"]
pub struct QueryHandle {
    state: State,
}

impl QueryHandle {
    pub(crate) fn spawn(
        runtime: &Handle,
        registry: Arc<Registry>,
        name: String,
        keys: Vec<String>,
    ) -> Self {
        let task = runtime.spawn(async move {
            let groups = grouped_sums(&registry, &name, &keys).await;
            debug!(metric = %name, ?keys, groups = groups.len(), "Evaluated sum query");
            GroupedSums { groups }
        });
        Self {
            state: State::Running(task),
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        Self {
            state: State::Ready(Some(error)),
        }
    }

    /// Abort the query if it has not completed.
    pub fn cancel(&self) {
        if let State::Running(task) = &self.state {
            task.abort();
        }
    }
}

impl Future for QueryHandle {
    type Output = Result<GroupedSums, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            State::Running(task) => Pin::new(task).poll(cx).map(|res| {
                res.map_err(|e| {
                    if e.is_cancelled() {
                        Error::QueryCancelled
                    } else {
                        Error::QueryFailed(e.to_string())
                    }
                })
            }),
            State::Ready(error) => match error.take() {
                Some(error) => Poll::Ready(Err(error)),
                None => Poll::Ready(Err(Error::QueryFailed("polled after completion".into()))),
            },
        }
    }
}
