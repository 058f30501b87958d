// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! A flattened, cumulative-weight view over a sketch's retained items,
//! built on demand to answer rank, quantile, CDF and PMF queries.

use std::cmp::Ordering;

use crate::error::Error;
use crate::kll::helper::normalized_rank_error;
use crate::kll::item::KllItem;

#[derive(Debug, Clone)]
pub(crate) struct SortedView<T: KllItem> {
    entries: Vec<Entry<T>>,
    total_weight: u64,
    min_k: u16,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    item: T,
    weight: u64,
}

impl<T: KllItem> SortedView<T> {
    fn new(mut entries: Vec<Entry<T>>, min_k: u16) -> Self {
        entries.sort_by(|a, b| T::cmp(&a.item, &b.item));
        let mut total_weight = 0u64;
        for entry in &mut entries {
            total_weight += entry.weight;
            entry.weight = total_weight;
        }
        Self {
            entries,
            total_weight,
            min_k,
        }
    }

    pub fn rank(&self, item: &T, inclusive: bool) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }

        let idx = if inclusive {
            upper_bound(&self.entries, item)
        } else {
            lower_bound(&self.entries, item)
        };

        if idx == 0 {
            return 0.0;
        }
        let weight = self.entries[idx - 1].weight;
        weight as f64 / self.total_weight as f64
    }

    /// Lower bound of the normalized-rank error interval around `rank(item)`.
    pub fn rank_lower_bound(&self, item: &T, inclusive: bool) -> f64 {
        let error = normalized_rank_error(self.min_k, false);
        (self.rank(item, inclusive) - error).max(0.0)
    }

    /// Upper bound of the normalized-rank error interval around `rank(item)`.
    pub fn rank_upper_bound(&self, item: &T, inclusive: bool) -> f64 {
        let error = normalized_rank_error(self.min_k, false);
        (self.rank(item, inclusive) + error).min(1.0)
    }

    pub fn quantile(&self, rank: f64, inclusive: bool) -> T {
        let weight = if inclusive {
            (rank * self.total_weight as f64).ceil() as u64
        } else {
            (rank * self.total_weight as f64) as u64
        };

        let idx = if inclusive {
            lower_bound_by_weight(&self.entries, weight)
        } else {
            upper_bound_by_weight(&self.entries, weight)
        };

        if idx >= self.entries.len() {
            return self.entries[self.entries.len() - 1].item.clone();
        }
        self.entries[idx].item.clone()
    }

    /// The item at the low end of the normalized-rank error interval around
    /// the requested `rank`, i.e. the quantile a caller could see if the
    /// true rank were actually `rank - error`.
    pub fn quantile_lower_bound(&self, rank: f64, inclusive: bool) -> T {
        let error = normalized_rank_error(self.min_k, false);
        self.quantile((rank - error).max(0.0), inclusive)
    }

    /// The item at the high end of the normalized-rank error interval.
    pub fn quantile_upper_bound(&self, rank: f64, inclusive: bool) -> T {
        let error = normalized_rank_error(self.min_k, false);
        self.quantile((rank + error).min(1.0), inclusive)
    }

    pub fn cdf(&self, split_points: &[T], inclusive: bool) -> Result<Vec<f64>, Error> {
        check_split_points(split_points)?;
        let mut ranks = Vec::with_capacity(split_points.len() + 1);
        for item in split_points {
            ranks.push(self.rank(item, inclusive));
        }
        ranks.push(1.0);
        Ok(ranks)
    }

    pub fn pmf(&self, split_points: &[T], inclusive: bool) -> Result<Vec<f64>, Error> {
        let mut buckets = self.cdf(split_points, inclusive)?;
        for i in (1..buckets.len()).rev() {
            buckets[i] -= buckets[i - 1];
        }
        Ok(buckets)
    }

    /// Iterates retained items in ascending order along with their implicit
    /// weight (number of original stream items each one represents).
    pub fn iter(&self) -> impl Iterator<Item = (&T, u64)> {
        let mut prev = 0u64;
        self.entries.iter().map(move |entry| {
            let weight = entry.weight - prev;
            prev = entry.weight;
            (&entry.item, weight)
        })
    }
}

pub(crate) fn build_sorted_view<T: KllItem>(levels: &[Vec<T>], min_k: u16) -> SortedView<T> {
    let num_retained: usize = levels.iter().map(|level| level.len()).sum();
    let mut entries = Vec::with_capacity(num_retained);

    for (level_idx, level) in levels.iter().enumerate() {
        let weight = 1u64 << level_idx;
        for item in level {
            entries.push(Entry {
                item: item.clone(),
                weight,
            });
        }
    }

    SortedView::new(entries, min_k)
}

fn check_split_points<T: KllItem>(split_points: &[T]) -> Result<(), Error> {
    let len = split_points.len();
    if len == 1 && T::is_nan(&split_points[0]) {
        return Err(Error::invalid_argument(
            "split_points must not contain NaN values",
        ));
    }
    for i in 0..len.saturating_sub(1) {
        if T::is_nan(&split_points[i]) {
            return Err(Error::invalid_argument(
                "split_points must not contain NaN values",
            ));
        }
        if T::cmp(&split_points[i], &split_points[i + 1]) == Ordering::Less {
            continue;
        }
        return Err(Error::invalid_argument(
            "split_points must be unique and monotonically increasing",
        ));
    }
    Ok(())
}

fn lower_bound<T: KllItem>(entries: &[Entry<T>], item: &T) -> usize {
    let mut left = 0usize;
    let mut right = entries.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if T::cmp(&entries[mid].item, item) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn upper_bound<T: KllItem>(entries: &[Entry<T>], item: &T) -> usize {
    let mut left = 0usize;
    let mut right = entries.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if T::cmp(&entries[mid].item, item) == Ordering::Greater {
            right = mid;
        } else {
            left = mid + 1;
        }
    }
    left
}

fn lower_bound_by_weight<T: KllItem>(entries: &[Entry<T>], weight: u64) -> usize {
    let mut left = 0usize;
    let mut right = entries.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if entries[mid].weight < weight {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn upper_bound_by_weight<T: KllItem>(entries: &[Entry<T>], weight: u64) -> usize {
    let mut left = 0usize;
    let mut right = entries.len();
    while left < right {
        let mid = left + (right - left) / 2;
        if entries[mid].weight > weight {
            right = mid;
        } else {
            left = mid + 1;
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_and_quantile_round_trip_on_uniform_data() {
        let levels = vec![(0..100i64).collect::<Vec<_>>()];
        let view = build_sorted_view(&levels, 200);
        assert_eq!(view.rank(&0, true), 0.01);
        assert_eq!(view.quantile(0.0, true), 0);
        assert_eq!(view.quantile(1.0, true), 99);
    }

    #[test]
    fn bounds_straddle_the_point_estimate() {
        let levels = vec![(0..100i64).collect::<Vec<_>>()];
        let view = build_sorted_view(&levels, 200);
        let r = view.rank(&50, true);
        assert!(view.rank_lower_bound(&50, true) <= r);
        assert!(view.rank_upper_bound(&50, true) >= r);
    }

    #[test]
    fn cdf_rejects_unsorted_split_points() {
        let levels = vec![(0..10i64).collect::<Vec<_>>()];
        let view = build_sorted_view(&levels, 200);
        assert!(view.cdf(&[5, 2], true).is_err());
    }
}
