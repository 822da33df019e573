//! Lazy, closeable result sequences.
//!
//! Every query result is an [`Iteration`]: a boxed [`CloseableIteration`]
//! that yields `Result<T, E>` items and holds storage resources (pinned
//! nodes, a reader registration) until it is exhausted, closed or dropped.
//!
//! # Invariants
//!
//! - `close` is idempotent and releases every held resource.
//! - Exhaustion closes the iteration.
//! - After an error has been yielded the iteration is closed.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// A lazy sequence of fallible items that can be closed early.
pub trait CloseableIteration<T, E>: Iterator<Item = Result<T, E>> {
    /// Release held resources. Later calls to `next` return `None`.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Errors raised by the iteration adapters themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationError {
    /// A time-limited iteration ran past its deadline.
    Timeout { limit: Duration },
}

impl std::fmt::Display for IterationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { limit } => {
                write!(f, "iteration exceeded its time limit of {limit:?}")
            }
        }
    }
}

impl std::error::Error for IterationError {}

/// Owned handle on a boxed closeable iteration.
pub struct Iteration<T, E> {
    inner: Box<dyn CloseableIteration<T, E> + Send>,
    peeked: Option<Result<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> Iteration<T, E> {
    #[must_use]
    pub fn new(inner: impl CloseableIteration<T, E> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            peeked: None,
        }
    }

    /// An iteration with no items.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(VecIteration {
            items: Vec::new().into_iter(),
            closed: true,
            _error: PhantomData,
        })
    }

    /// An iteration over already materialised items.
    #[must_use]
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::new(VecIteration {
            items: items.into_iter(),
            closed: false,
            _error: PhantomData,
        })
    }

    /// Convert each item, dropping those mapped to `None`.
    #[must_use]
    pub fn filter_map<U, F>(self, convert: F) -> Iteration<U, E>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<Option<U>, E> + Send + 'static,
    {
        Iteration::new(ConvertingIteration {
            source: self,
            convert,
        })
    }

    /// The same items with errors converted into `F`.
    #[must_use]
    pub fn err_into<F>(self) -> Iteration<T, F>
    where
        F: From<E> + Send + 'static,
    {
        Iteration::new(ErrIntoIteration {
            source: self,
            _target: PhantomData,
        })
    }

    /// Items of `self` followed by the items of each of `others`.
    #[must_use]
    pub fn union(self, others: Vec<Self>) -> Self {
        let mut parts = vec![self];
        parts.extend(others);
        Self::new(UnionIteration {
            parts: parts.into_iter().collect(),
        })
    }

    /// Stop with [`IterationError::Timeout`] once `limit` has passed.
    #[must_use]
    pub fn with_time_limit(self, limit: Duration) -> Self
    where
        E: From<IterationError>,
    {
        Self::new(TimeLimitIteration {
            deadline: Instant::now() + limit,
            limit,
            source: self,
            timed_out: false,
        })
    }

    /// True if another item (or an error) is available.
    pub fn has_next(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.inner.next();
        }
        self.peeked.is_some()
    }

    /// Collect the remaining items, stopping at the first error.
    pub fn collect_all(mut self) -> Result<Vec<T>, E> {
        let mut items = Vec::new();
        for item in &mut self {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T, E> Iterator for Iteration<T, E> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.peeked.take().or_else(|| self.inner.next());
        if matches!(item, Some(Err(_))) {
            self.inner.close();
        }
        item
    }
}

impl<T, E> CloseableIteration<T, E> for Iteration<T, E> {
    fn close(&mut self) {
        self.peeked = None;
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.peeked.is_none() && self.inner.is_closed()
    }
}

impl<T, E> Drop for Iteration<T, E> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

struct VecIteration<T, E> {
    items: std::vec::IntoIter<T>,
    closed: bool,
    _error: PhantomData<fn() -> E>,
}

impl<T, E> Iterator for VecIteration<T, E> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let item = self.items.next();
        if item.is_none() {
            self.closed = true;
        }
        item.map(Ok)
    }
}

impl<T, E> CloseableIteration<T, E> for VecIteration<T, E> {
    fn close(&mut self) {
        self.items = Vec::new().into_iter();
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Adapter giving a plain item iterator the closeable interface.
pub struct ItemsIteration<I> {
    items: I,
    closed: bool,
}

impl<I> ItemsIteration<I> {
    #[must_use]
    pub const fn new(items: I) -> Self {
        Self {
            items,
            closed: false,
        }
    }
}

impl<T, E, I: Iterator<Item = Result<T, E>>> Iterator for ItemsIteration<I> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let item = self.items.next();
        if item.is_none() {
            self.closed = true;
        }
        item
    }
}

impl<T, E, I: Iterator<Item = Result<T, E>>> CloseableIteration<T, E> for ItemsIteration<I> {
    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct ConvertingIteration<S, E, F> {
    source: Iteration<S, E>,
    convert: F,
}

impl<S, T, E, F> Iterator for ConvertingIteration<S, E, F>
where
    F: FnMut(S) -> Result<Option<T>, E>,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.source.next()? {
                Ok(item) => match (self.convert)(item) {
                    Ok(Some(converted)) => return Some(Ok(converted)),
                    Ok(None) => {}
                    Err(e) => {
                        self.source.close();
                        return Some(Err(e));
                    }
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<S, T, E, F> CloseableIteration<T, E> for ConvertingIteration<S, E, F>
where
    F: FnMut(S) -> Result<Option<T>, E>,
{
    fn close(&mut self) {
        self.source.close();
    }

    fn is_closed(&self) -> bool {
        self.source.is_closed()
    }
}

struct ErrIntoIteration<T, E, F> {
    source: Iteration<T, E>,
    _target: PhantomData<fn() -> F>,
}

impl<T, E, F: From<E>> Iterator for ErrIntoIteration<T, E, F> {
    type Item = Result<T, F>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next().map(|item| item.map_err(F::from))
    }
}

impl<T, E, F: From<E>> CloseableIteration<T, F> for ErrIntoIteration<T, E, F> {
    fn close(&mut self) {
        self.source.close();
    }

    fn is_closed(&self) -> bool {
        self.source.is_closed()
    }
}

struct UnionIteration<T, E> {
    parts: std::collections::VecDeque<Iteration<T, E>>,
}

impl<T, E> Iterator for UnionIteration<T, E> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(part) = self.parts.front_mut() {
            match part.next() {
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                Some(item) => return Some(item),
                None => {
                    self.parts.pop_front();
                }
            }
        }
        None
    }
}

impl<T, E> CloseableIteration<T, E> for UnionIteration<T, E> {
    fn close(&mut self) {
        for part in &mut self.parts {
            part.close();
        }
        self.parts.clear();
    }

    fn is_closed(&self) -> bool {
        self.parts.is_empty()
    }
}

struct TimeLimitIteration<T, E> {
    source: Iteration<T, E>,
    deadline: Instant,
    limit: Duration,
    timed_out: bool,
}

impl<T, E: From<IterationError>> Iterator for TimeLimitIteration<T, E> {
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.timed_out {
            return None;
        }
        if Instant::now() >= self.deadline {
            self.timed_out = true;
            self.source.close();
            tracing::debug!(limit = ?self.limit, "iteration timed out");
            return Some(Err(IterationError::Timeout { limit: self.limit }.into()));
        }
        self.source.next()
    }
}

impl<T, E: From<IterationError>> CloseableIteration<T, E> for TimeLimitIteration<T, E> {
    fn close(&mut self) {
        self.source.close();
    }

    fn is_closed(&self) -> bool {
        self.timed_out || self.source.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Failed,
        Iteration(IterationError),
    }

    impl From<IterationError> for TestError {
        fn from(e: IterationError) -> Self {
            Self::Iteration(e)
        }
    }

    fn numbers(items: Vec<u32>) -> Iteration<u32, TestError> {
        Iteration::from_vec(items)
    }

    #[test]
    fn test_has_next_does_not_consume() {
        let mut it = numbers(vec![1, 2]);
        assert!(it.has_next());
        assert!(it.has_next());
        assert_eq!(it.next(), Some(Ok(1)));
        assert_eq!(it.next(), Some(Ok(2)));
        assert!(!it.has_next());
        assert!(it.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut it = numbers(vec![1, 2, 3]);
        assert_eq!(it.next(), Some(Ok(1)));
        it.close();
        it.close();
        assert!(it.is_closed());
        assert_eq!(it.next(), None);
        assert!(Iteration::<u32, TestError>::empty().is_closed());
    }

    #[test]
    fn test_filter_map_converts_and_drops() {
        let it = numbers(vec![1, 2, 3, 4]).filter_map(|n| Ok((n % 2 == 0).then(|| n * 10)));
        assert_eq!(it.collect_all(), Ok(vec![20, 40]));
    }

    #[test]
    fn test_conversion_error_closes_source() {
        let mut it = numbers(vec![1, 2, 3]).filter_map(|n| {
            if n == 2 {
                Err(TestError::Failed)
            } else {
                Ok(Some(n))
            }
        });
        assert_eq!(it.next(), Some(Ok(1)));
        assert_eq!(it.next(), Some(Err(TestError::Failed)));
        assert_eq!(it.next(), None);
        assert!(it.is_closed());
    }

    #[test]
    fn test_union_concatenates() {
        let it = numbers(vec![1]).union(vec![numbers(vec![]), numbers(vec![2, 3])]);
        assert_eq!(it.collect_all(), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_time_limit_closes_inner() {
        let mut it = numbers(vec![1, 2, 3]).with_time_limit(Duration::ZERO);
        assert_eq!(
            it.next(),
            Some(Err(TestError::Iteration(IterationError::Timeout {
                limit: Duration::ZERO
            })))
        );
        assert_eq!(it.next(), None);
        assert!(it.is_closed());

        let generous = numbers(vec![1, 2]).with_time_limit(Duration::from_secs(60));
        assert_eq!(generous.collect_all(), Ok(vec![1, 2]));
    }

    #[test]
    fn test_err_into_converts_errors() {
        let it: Iteration<u32, IterationError> = Iteration::new(ItemsIteration::new(
            vec![Ok(1), Err(IterationError::Timeout { limit: Duration::ZERO })].into_iter(),
        ));
        let mut converted: Iteration<u32, TestError> = it.err_into();
        assert_eq!(converted.next(), Some(Ok(1)));
        assert!(matches!(converted.next(), Some(Err(TestError::Iteration(_)))));
        assert_eq!(converted.next(), None);
    }

    #[test]
    fn test_items_adapter_closes_on_exhaustion() {
        let mut it: Iteration<u32, TestError> =
            Iteration::new(ItemsIteration::new(vec![Ok(5)].into_iter()));
        assert_eq!(it.next(), Some(Ok(5)));
        assert_eq!(it.next(), None);
        assert!(it.is_closed());
    }
}
