//! Bounded, order-preserving fan-out over a list of entries.
//!
//! [`process_entries`] runs an async unit of work for every entry with at most
//! `concurrency` units in flight, and returns the results in input order no
//! matter in which order they complete. Everything runs inside the calling
//! task: units are multiplexed cooperatively, nothing is spawned, and dropping
//! the in-flight set is what cancels units after a failure.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

/// The first failing unit of a fan-out.
///
/// `index` is the entry that genuinely failed. `cancelled` lists the entries
/// that were still in flight and got aborted because of it; entries that were
/// never started appear in neither.
#[derive(Debug)]
pub struct FanOutFailure<E> {
    pub index: usize,
    pub source: E,
    pub cancelled: Vec<usize>,
}

impl<E> FanOutFailure<E> {
    /// Whether entry `index` was aborted (rather than failing itself).
    pub fn is_cancelled(&self, index: usize) -> bool {
        self.cancelled.contains(&index)
    }

    pub fn into_source(self) -> E {
        self.source
    }
}

impl<E: fmt::Display> fmt::Display for FanOutFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry {} failed ({} in-flight entries cancelled): {}",
            self.index,
            self.cancelled.len(),
            self.source
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FanOutFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

async fn indexed<F: Future>(index: usize, fut: F) -> (usize, F::Output) {
    (index, fut.await)
}

/// Applies `work` to every entry with at most `concurrency` units in flight.
///
/// `concurrency` of zero is treated as one. On success `result[i]` is the
/// output for `entries[i]`. The first failure cancels every unit still in
/// flight and is returned; no partial results are.
pub async fn process_entries<I, T, E, F, Fut>(
    entries: Vec<I>,
    concurrency: usize,
    mut work: F,
) -> Result<Vec<T>, FanOutFailure<E>>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = entries.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    if total == 1 {
        let mut entries = entries;
        let Some(entry) = entries.pop() else {
            return Ok(Vec::new());
        };
        return match work(entry).await {
            Ok(value) => Ok(vec![value]),
            Err(source) => Err(FanOutFailure {
                index: 0,
                source,
                cancelled: Vec::new(),
            }),
        };
    }

    let window = concurrency.max(1).min(total);
    let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    let mut pending = entries.into_iter().enumerate();
    let mut running = BTreeSet::new();
    let mut in_flight = FuturesUnordered::new();

    for (index, entry) in pending.by_ref().take(window) {
        running.insert(index);
        in_flight.push(indexed(index, work(entry)));
    }

    while let Some((index, outcome)) = in_flight.next().await {
        running.remove(&index);
        match outcome {
            Ok(value) => {
                slots[index] = Some(value);
                if let Some((next, entry)) = pending.next() {
                    running.insert(next);
                    in_flight.push(indexed(next, work(entry)));
                }
            }
            Err(source) => {
                drop(in_flight);
                let cancelled: Vec<usize> = running.into_iter().collect();
                debug!(
                    index,
                    cancelled = cancelled.len(),
                    total,
                    "Fan-out aborted on first failure"
                );
                return Err(FanOutFailure {
                    index,
                    source,
                    cancelled,
                });
            }
        }
    }

    let results: Vec<T> = slots.into_iter().flatten().collect();
    debug_assert_eq!(results.len(), total);
    Ok(results)
}
