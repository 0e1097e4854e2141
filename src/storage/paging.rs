//! Paging over the bounded history of a status.
//!
//! Results and events are stored oldest first, so page 1 is the tail of the
//! list: the most recent `page_size` items.

use std::ops::Range;

/// Independent paging for the results and the events of a status.
///
/// The default pages nothing, so a caller only interested in the streak or
/// the identity of a status pays for no history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PagingParams {
    pub events_page: i64,
    pub events_page_size: i64,
    pub results_page: i64,
    pub results_page_size: i64,
}

impl PagingParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, page: i64, page_size: i64) -> Self {
        self.events_page = page;
        self.events_page_size = page_size;
        self
    }

    pub fn with_results(mut self, page: i64, page_size: i64) -> Self {
        self.results_page = page;
        self.results_page_size = page_size;
        self
    }

    pub fn events_window(&self, total: usize) -> Range<usize> {
        window(total, self.events_page, self.events_page_size)
    }

    pub fn results_window(&self, total: usize) -> Range<usize> {
        window(total, self.results_page, self.results_page_size)
    }
}

/// Half-open index range of `page` among `total` items, counted from the end.
///
/// Out-of-range pages and invalid arguments yield an empty range.
pub fn window(total: usize, page: i64, page_size: i64) -> Range<usize> {
    if page < 1 || page_size < 0 {
        return 0..0;
    }
    let n = total as i64;
    let start = n.saturating_sub(page.saturating_mul(page_size)).clamp(0, n);
    let end = n
        .saturating_sub((page - 1).saturating_mul(page_size))
        .clamp(0, n);
    if start >= end {
        return 0..0;
    }
    start as usize..end as usize
}

/// Clone the items of `items[window]`.
pub fn page_of<T: Clone>(items: &[T], window: Range<usize>) -> Vec<T> {
    items.get(window).map(<[T]>::to_vec).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_from_the_tail() {
        assert_eq!(window(25, 1, 10), 15..25);
        assert_eq!(window(25, 2, 10), 5..15);
        assert_eq!(window(25, 3, 10), 0..5);
        assert!(window(25, 4, 10).is_empty());
    }

    #[test]
    fn test_window_invalid_arguments() {
        assert!(window(25, -1, 20).is_empty());
        assert!(window(25, 0, 20).is_empty());
        assert!(window(25, 1, -1).is_empty());
        assert!(window(25, 1, 0).is_empty());
        assert!(window(0, 1, 20).is_empty());
    }

    #[test]
    fn test_window_larger_than_total() {
        assert_eq!(window(3, 1, 20), 0..3);
        assert_eq!(window(3, 1, i64::MAX), 0..3);
        assert!(window(3, i64::MAX, 20).is_empty());
    }

    #[test]
    fn test_params_are_independent() {
        let params = PagingParams::new().with_results(1, 10).with_events(1, 1);
        assert_eq!(params.results_window(25), 15..25);
        assert_eq!(params.events_window(4), 3..4);
        assert!(PagingParams::new().results_window(25).is_empty());
    }

    #[test]
    fn test_page_of() {
        let items: Vec<u32> = (0..25).collect();
        assert_eq!(page_of(&items, window(25, 3, 10)), vec![0, 1, 2, 3, 4]);
        assert!(page_of(&items, window(25, 4, 10)).is_empty());
    }
}
