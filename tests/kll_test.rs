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

use kll_sketch::kll::DEFAULT_K;
use kll_sketch::kll::FixedCapacityAllocator;
use kll_sketch::kll::KllSketch;
use kll_sketch::kll::MAX_K;
use kll_sketch::kll::MIN_K;

const NUMERIC_NOISE_TOLERANCE: f64 = 1e-6;

fn assert_approx_eq(actual: f64, expected: f64, tolerance: f64) {
    let delta = (actual - expected).abs();
    assert!(
        delta <= tolerance,
        "expected {expected} +/- {tolerance}, got {actual}"
    );
}

fn rank_eps(sketch: &KllSketch<f32>) -> f64 {
    sketch.normalized_rank_error(false)
}

#[test]
fn test_k_limits() {
    assert!(KllSketch::<f32>::new(MIN_K).is_ok());
    assert!(KllSketch::<f32>::new(MAX_K).is_ok());
}

#[test]
fn test_k_too_small_rejected() {
    let err = KllSketch::<f32>::new(MIN_K - 1).unwrap_err();
    assert!(err.message().contains("k must be in"));
}

#[test]
fn test_empty() {
    let sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    assert!(sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert_eq!(sketch.n(), 0);
    assert_eq!(sketch.num_retained(), 0);
    assert!(sketch.min_item().is_none());
    assert!(sketch.max_item().is_none());
    assert!(sketch.rank(&0.0, true).is_none());
    assert!(sketch.quantile(0.5, true).unwrap().is_none());
    assert!(sketch.pmf(&[0.0f32], true).unwrap().is_none());
    assert!(sketch.cdf(&[0.0f32], true).unwrap().is_none());
}

#[test]
fn test_quantile_out_of_range_rejected() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch.update(0.0).unwrap();
    let err = sketch.quantile(-1.0, true).unwrap_err();
    assert!(err.message().contains("rank must be in [0.0, 1.0]"));
}

#[test]
fn test_one_item() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch.update(1.0).unwrap();
    assert!(!sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert_eq!(sketch.n(), 1);
    assert_eq!(sketch.num_retained(), 1);
    assert_eq!(sketch.rank(&1.0, false), Some(0.0));
    assert_eq!(sketch.rank(&1.0, true), Some(1.0));
    assert_eq!(sketch.rank(&2.0, false), Some(1.0));
    assert_eq!(sketch.min_item().cloned(), Some(1.0));
    assert_eq!(sketch.max_item().cloned(), Some(1.0));
    assert_eq!(sketch.quantile(0.5, true).unwrap(), Some(1.0));
}

#[test]
fn test_nan_is_ignored() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch.update(f32::NAN).unwrap();
    assert!(sketch.is_empty());
    sketch.update(0.0).unwrap();
    sketch.update(f32::NAN).unwrap();
    assert_eq!(sketch.n(), 1);
}

#[test]
fn test_many_items_exact_mode() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let n = DEFAULT_K as usize;
    for i in 1..=n {
        sketch.update(i as f32).unwrap();
        assert_eq!(sketch.n(), i as u64);
    }
    assert!(!sketch.is_empty());
    assert!(!sketch.is_estimation_mode());
    assert_eq!(sketch.num_retained(), n);
    assert_eq!(sketch.min_item().cloned(), Some(1.0));
    assert_eq!(sketch.quantile(0.0, true).unwrap(), Some(1.0));
    assert_eq!(sketch.max_item().cloned(), Some(n as f32));
    assert_eq!(sketch.quantile(1.0, true).unwrap(), Some(n as f32));

    for i in 1..=n {
        let inclusive_rank = i as f64 / n as f64;
        assert_eq!(sketch.rank(&(i as f32), true), Some(inclusive_rank));
        let exclusive_rank = (i - 1) as f64 / n as f64;
        assert_eq!(sketch.rank(&(i as f32), false), Some(exclusive_rank));
    }
}

#[test]
fn test_ten_items_quantiles() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    for i in 1..=10 {
        sketch.update(i as f32).unwrap();
    }
    assert_eq!(sketch.quantile(0.0, true).unwrap(), Some(1.0));
    assert_eq!(sketch.quantile(0.5, true).unwrap(), Some(5.0));
    assert_eq!(sketch.quantile(0.99, true).unwrap(), Some(10.0));
    assert_eq!(sketch.quantile(1.0, true).unwrap(), Some(10.0));
}

#[test]
fn test_hundred_items_quantiles() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    for i in 0..100 {
        sketch.update(i as f32).unwrap();
    }
    assert_eq!(sketch.quantile(0.0, true).unwrap(), Some(0.0));
    assert_eq!(sketch.quantile(0.01, true).unwrap(), Some(0.0));
    assert_eq!(sketch.quantile(0.5, true).unwrap(), Some(49.0));
    assert_eq!(sketch.quantile(0.99, true).unwrap(), Some(98.0));
    assert_eq!(sketch.quantile(1.0, true).unwrap(), Some(99.0));
}

#[test]
fn test_many_items_estimation_mode_rank_error() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let n = 10_000;
    for i in 0..n {
        sketch.update(i as f32).unwrap();
    }
    assert!(!sketch.is_empty());
    assert!(sketch.is_estimation_mode());
    assert_eq!(sketch.min_item().cloned(), Some(0.0));
    assert_eq!(sketch.max_item().cloned(), Some((n - 1) as f32));

    let rank_eps = rank_eps(&sketch);
    for i in (0..n).step_by(10) {
        let true_rank = i as f64 / n as f64;
        let rank = sketch.rank(&(i as f32), false).unwrap();
        assert_approx_eq(rank, true_rank, rank_eps);
    }

    assert!(sketch.num_retained() > 0);
}

#[test]
fn test_rank_cdf_pmf_consistency() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let n = 200;
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        sketch.update(i as f32).unwrap();
        values.push(i as f32);
    }

    let ranks = sketch.cdf(&values, false).unwrap().unwrap();
    let pmf = sketch.pmf(&values, false).unwrap().unwrap();

    let mut subtotal = 0.0;
    for i in 0..n {
        let rank = sketch.rank(&values[i], false).unwrap();
        assert_eq!(rank, ranks[i]);
        subtotal += pmf[i];
        assert!(
            (ranks[i] - subtotal).abs() <= NUMERIC_NOISE_TOLERANCE,
            "cdf vs pmf mismatch at index {i}"
        );
    }

    let ranks = sketch.cdf(&values, true).unwrap().unwrap();
    let pmf = sketch.pmf(&values, true).unwrap().unwrap();

    let mut subtotal = 0.0;
    for i in 0..n {
        let rank = sketch.rank(&values[i], true).unwrap();
        assert_eq!(rank, ranks[i]);
        subtotal += pmf[i];
        assert!(
            (ranks[i] - subtotal).abs() <= NUMERIC_NOISE_TOLERANCE,
            "cdf vs pmf mismatch at index {i}"
        );
    }
}

#[test]
fn test_out_of_order_split_points_rejected() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch.update(0.0).unwrap();
    let split_points = [1.0, 0.0];
    let err = sketch.cdf(&split_points, true).unwrap_err();
    assert!(err.message().contains("split_points must be unique and monotonically increasing"));
}

#[test]
fn test_nan_split_point_rejected() {
    let mut sketch = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch.update(0.0).unwrap();
    let split_points = [f32::NAN];
    let err = sketch.cdf(&split_points, true).unwrap_err();
    assert!(err.message().contains("split_points must not contain NaN values"));
}

#[test]
fn test_merge() {
    let mut sketch1 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let mut sketch2 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let n = 10_000;
    for i in 0..n {
        sketch1.update(i as f32).unwrap();
        sketch2.update((2 * n - i - 1) as f32).unwrap();
    }

    assert_eq!(sketch1.min_item().cloned(), Some(0.0));
    assert_eq!(sketch1.max_item().cloned(), Some((n - 1) as f32));
    assert_eq!(sketch2.min_item().cloned(), Some(n as f32));
    assert_eq!(sketch2.max_item().cloned(), Some((2 * n - 1) as f32));

    sketch1.merge(&sketch2).unwrap();

    assert!(!sketch1.is_empty());
    assert_eq!(sketch1.n(), (2 * n) as u64);
    assert_eq!(sketch1.min_item().cloned(), Some(0.0));
    assert_eq!(sketch1.max_item().cloned(), Some((2 * n - 1) as f32));
    let median = sketch1.quantile(0.5, true).unwrap().unwrap();
    let rank_eps = rank_eps(&sketch1);
    assert_approx_eq(median as f64, n as f64, n as f64 * rank_eps);
}

#[test]
fn test_merge_lower_k() {
    let mut sketch1 = KllSketch::<f32>::new(256).unwrap();
    let mut sketch2 = KllSketch::<f32>::new(128).unwrap();
    let n = 10_000;
    for i in 0..n {
        sketch1.update(i as f32).unwrap();
        sketch2.update((2 * n - i - 1) as f32).unwrap();
    }

    sketch1.merge(&sketch2).unwrap();

    assert_eq!(sketch1.n(), (2 * n) as u64);
    assert_eq!(sketch1.min_item().cloned(), Some(0.0));
    assert_eq!(sketch1.max_item().cloned(), Some((2 * n - 1) as f32));
    assert_eq!(
        sketch1.normalized_rank_error(false),
        sketch2.normalized_rank_error(false)
    );
    assert_eq!(
        sketch1.normalized_rank_error(true),
        sketch2.normalized_rank_error(true)
    );
    let median = sketch1.quantile(0.5, true).unwrap().unwrap();
    let rank_eps = rank_eps(&sketch1);
    assert_approx_eq(median as f64, n as f64, n as f64 * rank_eps);
}

#[test]
fn test_merge_exact_mode_lower_k() {
    let mut sketch1 = KllSketch::<f32>::new(256).unwrap();
    let sketch2 = KllSketch::<f32>::new(128).unwrap();
    let n = 10_000;
    for i in 0..n {
        sketch1.update(i as f32).unwrap();
    }

    let err_before = sketch1.normalized_rank_error(true);
    sketch1.merge(&sketch2).unwrap();
    assert_eq!(sketch1.normalized_rank_error(true), err_before);

    assert_eq!(sketch1.n(), n as u64);
    assert_eq!(sketch1.min_item().cloned(), Some(0.0));
    assert_eq!(sketch1.max_item().cloned(), Some((n - 1) as f32));
    let median = sketch1.quantile(0.5, true).unwrap().unwrap();
    let rank_eps = rank_eps(&sketch1);
    assert_approx_eq(median as f64, (n / 2) as f64, (n as f64 / 2.0) * rank_eps);
}

#[test]
fn test_merge_min_max_from_other() {
    let mut sketch1 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    let mut sketch2 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch1.update(1.0).unwrap();
    sketch2.update(2.0).unwrap();
    sketch2.merge(&sketch1).unwrap();
    assert_eq!(sketch2.min_item().cloned(), Some(1.0));
    assert_eq!(sketch2.max_item().cloned(), Some(2.0));
}

#[test]
fn test_merge_min_max_large_other() {
    let mut sketch1 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    for i in 0..1_000_000 {
        sketch1.update(i as f32).unwrap();
    }
    let mut sketch2 = KllSketch::<f32>::new(DEFAULT_K).unwrap();
    sketch2.merge(&sketch1).unwrap();
    assert_eq!(sketch2.min_item().cloned(), Some(0.0));
    assert_eq!(sketch2.max_item().cloned(), Some(999_999.0));
}

#[test]
fn test_merge_incompatible_m_rejected() {
    let mut sketch1 = KllSketch::<f32>::with_m(DEFAULT_K, 8).unwrap();
    let mut sketch2 = KllSketch::<f32>::with_m(DEFAULT_K, 4).unwrap();
    sketch1.update(1.0).unwrap();
    sketch2.update(2.0).unwrap();
    let err = sketch1.merge(&sketch2).unwrap_err();
    assert!(err.message().contains("incompatible m values"));
}

#[test]
fn test_update_weighted_matches_repeated_unit_updates() {
    let mut weighted = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    let mut unweighted = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    for i in 0..50i64 {
        weighted.update_weighted(i, 7).unwrap();
        for _ in 0..7 {
            unweighted.update(i).unwrap();
        }
    }
    assert_eq!(weighted.n(), unweighted.n());
    assert_eq!(
        weighted.quantile(0.5, true).unwrap(),
        unweighted.quantile(0.5, true).unwrap()
    );
}

#[test]
fn test_update_weighted_rejects_zero_weight() {
    let mut sketch = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    let err = sketch.update_weighted(1, 0).unwrap_err();
    assert!(err.message().contains("weight must be >= 1"));
}

#[test]
fn test_update_weighted_keeps_higher_levels_sorted_across_merge() {
    // A weight with a set bit above bit 0 lands an item directly into a
    // higher level; that level must stay sorted so a later merge's
    // level-by-level concatenation produces correct quantiles.
    let mut sketch1 = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    for i in 0..2_000i64 {
        sketch1.update(i).unwrap();
    }
    sketch1.update_weighted(-1, 4).unwrap();
    sketch1.update_weighted(5_000, 2).unwrap();

    let mut sketch2 = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    for i in 2_000..4_000i64 {
        sketch2.update(i).unwrap();
    }

    sketch1.merge(&sketch2).unwrap();

    assert_eq!(sketch1.min_item().cloned(), Some(-1));
    assert_eq!(sketch1.max_item().cloned(), Some(5_000));
    assert_eq!(sketch1.quantile(0.0, true).unwrap(), Some(-1));
    assert_eq!(sketch1.quantile(1.0, true).unwrap(), Some(5_000));
}

#[test]
fn test_update_many_bulk_loads_items() {
    let mut sketch = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    sketch.update_many(0..1000i64).unwrap();
    assert_eq!(sketch.n(), 1000);
    assert_eq!(sketch.min_item().cloned(), Some(0));
    assert_eq!(sketch.max_item().cloned(), Some(999));
}

#[test]
fn test_reset_returns_to_empty() {
    let mut sketch = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    sketch.update_many(0..10_000i64).unwrap();
    assert!(sketch.is_estimation_mode());
    sketch.reset().unwrap();
    assert!(sketch.is_empty());
    assert_eq!(sketch.n(), 0);
    assert_eq!(sketch.k(), DEFAULT_K);
}

#[test]
fn test_serialize_deserialize_round_trip() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    for i in 0..5_000 {
        sketch.update(i as f64).unwrap();
    }
    let bytes = sketch.serialize();
    let restored = KllSketch::<f64>::deserialize(&bytes).unwrap();
    assert_eq!(restored.n(), sketch.n());
    assert_eq!(restored.min_item().cloned(), sketch.min_item().cloned());
    assert_eq!(restored.max_item().cloned(), sketch.max_item().cloned());
    assert_eq!(
        restored.quantile(0.5, true).unwrap(),
        sketch.quantile(0.5, true).unwrap()
    );
}

#[test]
fn test_serialize_empty_round_trips() {
    let sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    let bytes = sketch.serialize();
    assert_eq!(bytes.len(), 8);
    let restored = KllSketch::<f64>::deserialize(&bytes).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn test_serialize_single_item_round_trips() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    sketch.update(42.0).unwrap();
    let bytes = sketch.serialize();
    let restored = KllSketch::<f64>::deserialize(&bytes).unwrap();
    assert_eq!(restored.n(), 1);
    assert_eq!(restored.min_item().cloned(), Some(42.0));
    assert_eq!(restored.max_item().cloned(), Some(42.0));
}

#[test]
fn test_wrap_produces_read_only_sketch() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    sketch.update_many((0..1000).map(|i| i as f64)).unwrap();
    let bytes = sketch.serialize();

    let mut wrapped = KllSketch::<f64>::wrap(&bytes).unwrap();
    assert!(wrapped.is_read_only());
    assert_eq!(wrapped.n(), sketch.n());
    let err = wrapped.update(1.0).unwrap_err();
    assert!(err.message().contains("read-only"));
}

#[test]
fn test_writable_wrap_round_trips_and_allows_growth() {
    let mut sketch = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    sketch.update_many(0..2_000i64).unwrap();
    let bytes = sketch.serialize_updatable();

    let allocator = FixedCapacityAllocator::new(1 << 20);
    let mut wrapped = KllSketch::<i64>::writable_wrap(&bytes, allocator).unwrap();
    assert!(wrapped.is_direct());
    assert!(!wrapped.is_read_only());
    assert_eq!(wrapped.n(), sketch.n());
    assert_eq!(
        wrapped.quantile(0.5, true).unwrap(),
        sketch.quantile(0.5, true).unwrap()
    );

    wrapped.update(123_456).unwrap();
    assert_eq!(wrapped.n(), sketch.n() + 1);
}

#[test]
fn test_writable_wrap_reports_out_of_capacity() {
    let mut sketch = KllSketch::<i64>::new(DEFAULT_K).unwrap();
    sketch.update_many(0..2_000i64).unwrap();
    let bytes = sketch.serialize_updatable();

    let allocator = FixedCapacityAllocator::new(1);
    let mut wrapped = KllSketch::<i64>::writable_wrap(&bytes, allocator).unwrap();
    let err = wrapped.update_many(0..2_000_000i64).unwrap_err();
    assert_eq!(err.kind(), kll_sketch::error::ErrorKind::OutOfCapacity);
}

#[test]
fn test_serialized_size_bytes_matches_actual_output() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    sketch.update_many((0..3_000).map(|i| i as f64)).unwrap();
    assert_eq!(sketch.serialized_size_bytes(), sketch.serialize().len());
}

#[test]
fn test_max_serialized_size_bytes_bounds_actual_output() {
    let mut sketch = KllSketch::<f64>::new(DEFAULT_K).unwrap();
    let n = 5_000u64;
    sketch.update_many((0..n).map(|i| i as f64)).unwrap();

    let bound = kll_sketch::kll::max_serialized_size_bytes(DEFAULT_K, n, 8, false, 8);
    assert!(bound >= sketch.serialize().len());

    let empty_bound = kll_sketch::kll::max_serialized_size_bytes(DEFAULT_K, 0, 8, false, 8);
    assert_eq!(empty_bound, 8);
}

#[test]
fn test_string_items_are_supported() {
    let mut sketch = KllSketch::<String>::new(DEFAULT_K).unwrap();
    for word in ["pear", "apple", "banana", "cherry"] {
        sketch.update(word.to_string()).unwrap();
    }
    assert_eq!(sketch.min_item().cloned(), Some("apple".to_string()));
    assert_eq!(sketch.max_item().cloned(), Some("pear".to_string()));
}
