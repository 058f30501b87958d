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

//! Level-capacity index math shared by the compactor, the merge engine and
//! the serialization pre-sizing helpers.

const POWERS_OF_THREE: [u64; 31] = [
    1,
    3,
    9,
    27,
    81,
    243,
    729,
    2187,
    6561,
    19683,
    59049,
    177147,
    531441,
    1594323,
    4782969,
    14348907,
    43046721,
    129140163,
    387420489,
    1162261467,
    3486784401,
    10460353203,
    31381059609,
    94143178827,
    282429536481,
    847288609443,
    2541865828329,
    7625597484987,
    22876792454961,
    68630377364883,
    205891132094649,
];

/// Sums [`level_capacity`] over all levels of a sketch with the given shape.
pub fn compute_total_capacity(k: u16, m: u8, num_levels: usize) -> u32 {
    let mut total: u32 = 0;
    for level in 0..num_levels {
        total += level_capacity(k, num_levels, level, m);
    }
    total
}

/// Returns the target retained-item capacity of `level` within a sketch that
/// currently has `num_levels` levels.
pub fn level_capacity(k: u16, num_levels: usize, level: usize, min_wid: u8) -> u32 {
    assert!(level < num_levels, "level must be < num_levels");
    let depth = num_levels - level - 1;
    let cap = int_cap_aux(k, depth as u32);
    std::cmp::max(min_wid as u32, cap as u32)
}

/// The KLL capacity recurrence, clamped for large depths by halving instead
/// of panicking once `depth` runs past the precomputed range.
pub fn int_cap_aux(k: u16, depth: u32) -> u16 {
    if depth <= 30 {
        return int_cap_aux_aux(k, depth as u8);
    }
    let half = depth / 2;
    let rest = depth - half;
    let tmp = int_cap_aux_aux(k, half.min(30) as u8);
    int_cap_aux_aux(tmp, rest.min(30) as u8)
}

/// `int_cap_aux_aux(k, depth) = ((2k * 2^depth / 3^depth) + 1) >> 1`, for
/// `depth <= 30`, computed with 64-bit integer math.
pub fn int_cap_aux_aux(k: u16, depth: u8) -> u16 {
    assert!(depth <= 30, "depth must be <= 30");
    let twok = (k as u64) << 1;
    let tmp = (twok << depth) / POWERS_OF_THREE[depth as usize];
    let result = (tmp + 1) >> 1;
    debug_assert!(result <= k as u64, "capacity result must not exceed k");
    result.min(k as u64) as u16
}

/// Normalized rank error bound for a sketch whose effective k (the minimum
/// k across all sketches contributing to it via merges) is `min_k`.
///
/// `pmf` selects the (slightly larger) bound that applies to PMF/histogram
/// buckets as opposed to a single rank or quantile query.
pub fn normalized_rank_error(min_k: u16, pmf: bool) -> f64 {
    let k = min_k as f64;
    if pmf {
        2.446 / k.powf(0.9433)
    } else {
        2.296 / k.powf(0.9723)
    }
}

/// Total weighted count represented by `level_sizes[i]` retained items at
/// level `i`.
pub fn sum_the_sample_weights(level_sizes: &[usize]) -> u64 {
    let mut total = 0u64;
    let mut weight = 1u64;
    for &size in level_sizes {
        total += weight * size as u64;
        weight <<= 1;
    }
    total
}

/// Upper-bounds the number of levels a sketch might ever need in order to
/// hold `n` updates. Used to pre-size a freshly constructed or deserialized
/// sketch before its exact shape is known.
pub fn ub_on_num_levels(n: u64) -> usize {
    if n == 0 {
        return 1;
    }
    64 - n.leading_zeros() as usize + 1
}

/// Pessimistic upper bound on the serialized length (bytes) of a sketch that
/// has seen `n` updates with parameters `k`/`m`, assuming each retained item
/// serializes to at most `sample_bytes` bytes.
///
/// Intended for callers who want to pre-allocate a destination buffer before
/// calling [`crate::kll::KllSketch::serialize`] or
/// [`crate::kll::KllSketch::serialize_updatable`].
pub fn max_serialized_size_bytes(
    k: u16,
    n: u64,
    m: u8,
    updatable: bool,
    sample_bytes: usize,
) -> usize {
    if n == 0 {
        return 8;
    }
    let num_levels = ub_on_num_levels(n);
    let capacity = compute_total_capacity(k, m, num_levels) as usize;
    const PREAMBLE_BYTES: usize = 20;
    let levels_bytes = if updatable {
        (num_levels + 1) * 4
    } else {
        num_levels * 4
    };
    let retained = if updatable {
        capacity
    } else {
        capacity.min(n as usize)
    };
    PREAMBLE_BYTES + levels_bytes + 2 * sample_bytes + retained * sample_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_capacities_k1000() {
        // Published KLL capacity table at k = 1000, depths 19..0.
        let expected = [
            1000u16, 667, 444, 296, 198, 132, 88, 59, 39, 26, 17, 12, 8, 5, 3, 2, 2, 1, 1, 0,
        ];
        for (depth, &want) in (0..20u32).zip(expected.iter()) {
            let got = int_cap_aux(1000, depth);
            assert_eq!(got, want, "depth {depth}");
        }
    }

    #[test]
    fn total_capacity_is_monotonic_in_levels() {
        let one = compute_total_capacity(200, 8, 1);
        let two = compute_total_capacity(200, 8, 2);
        assert!(two >= one);
    }

    #[test]
    fn ub_on_num_levels_base_case() {
        assert_eq!(ub_on_num_levels(0), 1);
        assert!(ub_on_num_levels(1_000_000) > ub_on_num_levels(1));
    }
}
