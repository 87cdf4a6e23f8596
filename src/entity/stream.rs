//! Stream helpers for cache pipelines.

use futures::future::ready;
use futures::stream::{self, BoxStream, Stream, StreamExt};

/// Drops `Ok` items equal to the previous `Ok` item. Errors pass through.
pub fn distinct_until_changed<S, T, E>(upstream: S) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
    T: Clone + PartialEq,
{
    let mut last: Option<T> = None;
    upstream.filter_map(move |item| {
        let item = match item {
            Ok(value) if last.as_ref() == Some(&value) => None,
            Ok(value) => {
                last = Some(value.clone());
                Some(Ok(value))
            }
            Err(e) => Some(Err(e)),
        };
        ready(item)
    })
}

/// A pipeline producing exactly one value.
pub(crate) fn just<T, E>(value: T) -> BoxStream<'static, Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    stream::once(ready(Ok(value))).boxed()
}
