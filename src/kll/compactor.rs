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

//! The KLL compactor: the core step that keeps every level within its
//! target capacity by halving a full level and promoting half its contents,
//! doubling their implicit weight, one level up.

use std::cmp::Ordering;

use crate::common::RandomSource;
use crate::error::Error;
use crate::kll::helper::compute_total_capacity;
use crate::kll::helper::level_capacity;
use crate::kll::item::KllItem;
use crate::kll::storage::AllocationCallback;

/// Requests room for one more level from `alloc`, or, for a heap-backed
/// sketch (`alloc` is `None` and `is_direct` is false), does nothing since
/// `Vec::push` below grows the backing allocation implicitly.
///
/// A direct (non-heap) sketch with no callback configured cannot grow and
/// reports [`ErrorKind::OutOfCapacity`](crate::error::ErrorKind::OutOfCapacity).
fn request_growth(
    alloc: &mut Option<&mut dyn AllocationCallback>,
    is_direct: bool,
    k: u16,
    m: u8,
    new_num_levels: usize,
) -> Result<(), Error> {
    let new_total = compute_total_capacity(k, m, new_num_levels) as usize;
    match alloc {
        Some(cb) => cb.request(new_total),
        None if is_direct => Err(Error::out_of_capacity(
            "direct sketch has no allocation callback configured",
        )),
        None => Ok(()),
    }
}

/// Appends one empty level, requesting room for it first through `alloc`
/// when the sketch is direct. Used by weighted updates to reach a level
/// that ordinary single-item compaction hasn't grown into yet.
pub(crate) fn grow_one_level<T>(
    levels: &mut Vec<Vec<T>>,
    k: u16,
    m: u8,
    mut alloc: Option<&mut dyn AllocationCallback>,
    is_direct: bool,
) -> Result<(), Error> {
    request_growth(&mut alloc, is_direct, k, m, levels.len() + 1)?;
    levels.push(Vec::new());
    Ok(())
}

/// Compacts `levels[level]` in place (it must already be at or over its
/// target capacity) and recurses upward for as long as the promotion leaves
/// the next level overfull, growing the levels vector when the top level
/// itself overflows.
///
/// `alloc`/`is_direct` route growth through a non-heap-backed sketch's
/// [`AllocationCallback`] (see `kll::sketch`); pass `None`/`false` for an
/// ordinary heap-backed sketch.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compact_from<T, R>(
    levels: &mut Vec<Vec<T>>,
    start_level: usize,
    k: u16,
    m: u8,
    rng: &mut R,
    is_level_zero_sorted: &mut bool,
    mut alloc: Option<&mut dyn AllocationCallback>,
    is_direct: bool,
) -> Result<(), Error>
where
    T: KllItem,
    R: RandomSource,
{
    let mut level = start_level;
    loop {
        let num_levels = levels.len();
        let cap = level_capacity(k, num_levels, level, m) as usize;
        if levels[level].len() < cap {
            break;
        }
        if level + 1 == levels.len() {
            request_growth(&mut alloc, is_direct, k, m, levels.len() + 1)?;
            levels.push(Vec::new());
        }
        compact_one_level(levels, level, rng, is_level_zero_sorted);
        level += 1;
    }
    Ok(())
}

/// Compacts a single overfull level: sorts it (level 0 only, if not already
/// sorted), peels off one leftover item if the count is odd (kept at the
/// low end of the popped range), flips one coin to choose which half of the
/// remaining even-length run to promote, and merges the promoted half into
/// the level above.
fn compact_one_level<T, R>(
    levels: &mut [Vec<T>],
    level: usize,
    rng: &mut R,
    is_level_zero_sorted: &mut bool,
) where
    T: KllItem,
    R: RandomSource,
{
    let mut current = std::mem::take(&mut levels[level]);
    let mut above = std::mem::take(&mut levels[level + 1]);

    if level == 0 && !*is_level_zero_sorted {
        current.sort_by(T::cmp);
    }
    if level == 0 {
        *is_level_zero_sorted = true;
    }

    let odd = current.len() % 2 == 1;
    let leftover = if odd { Some(current.remove(0)) } else { None };

    let use_up = above.is_empty();
    let promoted = downsample(current, rng.next_bool(), use_up);
    above = if above.is_empty() {
        promoted
    } else {
        merge_sorted_vec(promoted, above)
    };
    levels[level + 1] = above;

    let mut new_level = Vec::new();
    if let Some(item) = leftover {
        new_level.push(item);
    }
    levels[level] = new_level;
}

/// Re-compacts a freshly merged (but possibly still overfull at several
/// levels) set of levels until every level is within its target capacity
/// for the given `k`/`m`, growing the level count as needed.
///
/// Mirrors [`compact_from`]'s up-propagation but, matching the original
/// KLL merge algorithm, only compacts a level when doing so is actually
/// necessary to bring the total retained-item count within budget — a
/// level that is locally over capacity but whose total is still within
/// the target is left alone, since it will shed items naturally as further
/// updates land.
#[allow(clippy::too_many_arguments)]
pub(crate) fn general_compress<T, R>(
    mut levels_in: Vec<Vec<T>>,
    k: u16,
    m: u8,
    rng: &mut R,
    is_level_zero_sorted: bool,
    mut alloc: Option<&mut dyn AllocationCallback>,
    is_direct: bool,
) -> Result<Vec<Vec<T>>, Error>
where
    T: KllItem,
    R: RandomSource,
{
    let mut current_num_levels = levels_in.len();
    let mut current_item_count: usize = levels_in.iter().map(|level| level.len()).sum();
    let mut target_item_count =
        crate::kll::helper::compute_total_capacity(k, m, current_num_levels) as usize;
    let mut levels_out = Vec::with_capacity(current_num_levels + 1);
    let mut sorted_zero = is_level_zero_sorted;

    let mut current_level = 0usize;
    while current_level < current_num_levels {
        if current_level + 1 >= levels_in.len() {
            levels_in.push(Vec::new());
        }

        let raw_pop = levels_in[current_level].len();
        let cap = level_capacity(k, current_num_levels, current_level, m) as usize;

        if current_item_count < target_item_count || raw_pop < cap {
            levels_out.push(std::mem::take(&mut levels_in[current_level]));
        } else {
            let mut current = std::mem::take(&mut levels_in[current_level]);
            let mut above = std::mem::take(&mut levels_in[current_level + 1]);

            if current_level == 0 && !sorted_zero {
                current.sort_by(T::cmp);
                sorted_zero = true;
            }

            let odd = current.len() % 2 == 1;
            let leftover = if odd { Some(current.remove(0)) } else { None };

            let use_up = above.is_empty();
            let promoted = downsample(current, rng.next_bool(), use_up);
            let promoted_len = promoted.len();
            above = if above.is_empty() {
                promoted
            } else {
                merge_sorted_vec(promoted, above)
            };
            levels_in[current_level + 1] = above;

            let mut out_level = Vec::new();
            if let Some(item) = leftover {
                out_level.push(item);
            }
            levels_out.push(out_level);

            current_item_count = current_item_count.saturating_sub(promoted_len);

            if current_level == current_num_levels - 1 {
                request_growth(&mut alloc, is_direct, k, m, current_num_levels + 1)?;
                current_num_levels += 1;
                target_item_count +=
                    level_capacity(k, current_num_levels, 0, m) as usize;
                if levels_in.len() < current_num_levels + 1 {
                    levels_in.resize_with(current_num_levels + 1, Vec::new);
                }
            }
        }
        current_level += 1;
    }

    levels_out.truncate(current_num_levels);
    Ok(levels_out)
}

/// Halves `items` (which must have even length), keeping every other item
/// starting at a coin-flip-chosen parity. `use_up` biases the parity so
/// that, when the destination level is currently empty, the kept items are
/// the ones that preserve the destination's eventual sort order cheaply
/// (matches the teacher's existing `downsample` precedent).
fn downsample<T: KllItem>(items: Vec<T>, coin: bool, use_up: bool) -> Vec<T> {
    let len = items.len();
    debug_assert!(len % 2 == 0, "length must be even after peeling leftover");
    let offset = if coin { 1 } else { 0 };
    let parity = if use_up { (len + offset + 1) % 2 } else { offset };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| if idx % 2 == parity { Some(item) } else { None })
        .collect()
}

/// Merges two ascending runs into one ascending run.
pub(crate) fn merge_sorted_vec<T: KllItem>(left: Vec<T>, right: Vec<T>) -> Vec<T> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    while let (Some(l), Some(r)) = (left_iter.peek(), right_iter.peek()) {
        if T::cmp(l, r) == Ordering::Less {
            merged.push(left_iter.next().unwrap());
        } else {
            merged.push(right_iter.next().unwrap());
        }
    }
    merged.extend(left_iter);
    merged.extend(right_iter);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::XorShift64;

    #[test]
    fn compact_promotes_half_and_keeps_leftover_on_odd_count() {
        let mut levels: Vec<Vec<i64>> = vec![vec![5, 3, 1, 4, 2], vec![]];
        let mut rng = XorShift64::seeded(42);
        let mut sorted = false;
        compact_from(&mut levels, 0, 20, 8, &mut rng, &mut sorted, None, false).unwrap();
        assert_eq!(levels[0].len(), 1);
        assert_eq!(levels[1].len(), 2);
        let mut all: Vec<i64> = levels.into_iter().flatten().collect();
        all.sort();
        // one leftover (weight 1) + two promoted (weight 2 each) == 5 original items
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn merge_sorted_vec_merges_ascending_runs() {
        let merged = merge_sorted_vec(vec![1, 3, 5], vec![2, 4, 6]);
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 6]);
    }
}
