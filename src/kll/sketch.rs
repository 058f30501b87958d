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

use std::cmp::Ordering;
use std::fmt;

use super::DEFAULT_M;
use super::MAX_K;
use super::compactor;
use super::helper::compute_total_capacity;
use super::helper::level_capacity;
use super::helper::normalized_rank_error;
use super::helper::sum_the_sample_weights;
use super::serialization::DATA_START;
use super::serialization::DATA_START_SINGLE_ITEM;
use super::serialization::EMPTY_SIZE_BYTES;
use super::serialization::FLAG_DOUBLES_ELEMENT;
use super::serialization::FLAG_EMPTY;
use super::serialization::FLAG_LEVEL_ZERO_SORTED;
use super::serialization::FLAG_SINGLE_ITEM;
use super::serialization::FLAG_UPDATABLE;
use super::serialization::KLL_FAMILY_ID;
use super::serialization::PREAMBLE_INTS_FULL;
use super::serialization::PREAMBLE_INTS_SHORT;
use super::serialization::SERIAL_VERSION_1;
use super::serialization::SERIAL_VERSION_2;
use super::serialization::SERIAL_VERSION_3;
use super::sorted_view::build_sorted_view;
use super::storage::AllocationCallback;
use crate::codec::SketchBytes;
use crate::codec::SketchSlice;
use crate::common::RandomSource;
use crate::common::XorShift64;
use crate::error::Error;
use crate::kll::item::KllItem;

/// KLL sketch for estimating quantiles and ranks over a stream seen at most
/// once.
///
/// `T` is the retained element type (see [`KllItem`]); `R` is the source of
/// the fair coin flips the compactor uses to decide which half of a full
/// level to promote, defaulting to [`XorShift64`]. Swap in a deterministic
/// `R` (e.g. a fixed-seed `XorShift64` or a test double) to get reproducible
/// compaction in tests.
///
/// See the [kll module level documentation](crate::kll) for more.
pub struct KllSketch<T: KllItem, R: RandomSource = XorShift64> {
    k: u16,
    m: u8,
    min_k: u16,
    n: u64,
    is_level_zero_sorted: bool,
    levels: Vec<Vec<T>>,
    min_item: Option<T>,
    max_item: Option<T>,
    /// `true` for a sketch decoded with [`KllSketch::wrap`]: every mutator
    /// rejects the call instead of touching the underlying bytes.
    read_only: bool,
    /// `true` for a sketch whose growth must clear an [`AllocationCallback`]
    /// (built via [`KllSketch::writable_wrap`]) rather than growing freely.
    is_direct: bool,
    alloc: Option<Box<dyn AllocationCallback>>,
    rng: R,
}

impl<T: KllItem + fmt::Debug, R: RandomSource> fmt::Debug for KllSketch<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KllSketch")
            .field("k", &self.k)
            .field("m", &self.m)
            .field("min_k", &self.min_k)
            .field("n", &self.n)
            .field("num_retained", &self.num_retained())
            .field("read_only", &self.read_only)
            .field("is_direct", &self.is_direct)
            .finish()
    }
}

impl<T: KllItem, R: RandomSource + Default> KllSketch<T, R> {
    /// Creates a new heap-backed sketch with the given value of k and the
    /// default minimum weight-doubling fan-in ([`DEFAULT_M`]).
    ///
    /// # Examples
    ///
    /// ```
    /// use kll_sketch::kll::KllSketch;
    ///
    /// let sketch = KllSketch::<f64>::new(200).unwrap();
    /// assert_eq!(sketch.k(), 200);
    /// ```
    pub fn new(k: u16) -> Result<Self, Error> {
        Self::with_rng_and_m(k, DEFAULT_M, R::default())
    }

    /// Like [`KllSketch::new`], with an explicit `m`.
    pub fn with_m(k: u16, m: u8) -> Result<Self, Error> {
        Self::with_rng_and_m(k, m, R::default())
    }

    /// Decodes a sketch from the compact serialization format (the wire
    /// format produced by [`KllSketch::serialize`]) into a fully owned,
    /// heap-backed, mutable sketch.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        Self::decode(bytes, false)
    }

    /// Decodes a sketch from the compact format into a read-only view: every
    /// mutating method on the result returns
    /// [`ErrorKind::InvalidArgument`](crate::error::ErrorKind::InvalidArgument).
    ///
    /// Use this when the caller only intends to query an externally owned
    /// buffer (e.g. memory-mapped from disk) without needing to grow it.
    pub fn wrap(bytes: &[u8]) -> Result<Self, Error> {
        let mut sketch = Self::decode(bytes, false)?;
        sketch.read_only = true;
        Ok(sketch)
    }

    /// Decodes a sketch from the updatable serialization format (produced by
    /// [`KllSketch::serialize_updatable`]) into a mutable sketch whose every
    /// growth must first clear `alloc`, so it never exceeds whatever budget
    /// the caller tracks for it externally.
    pub fn writable_wrap(
        bytes: &[u8],
        alloc: impl AllocationCallback + 'static,
    ) -> Result<Self, Error> {
        let mut sketch = Self::decode(bytes, true)?;
        sketch.is_direct = true;
        sketch.alloc = Some(Box::new(alloc));
        Ok(sketch)
    }
}

impl<T: KllItem, R: RandomSource> KllSketch<T, R> {
    /// Like [`KllSketch::new`], with an explicit random source.
    pub fn with_rng(k: u16, rng: R) -> Result<Self, Error> {
        Self::with_rng_and_m(k, DEFAULT_M, rng)
    }

    /// Like [`KllSketch::new`], with both an explicit `m` and random source.
    pub fn with_rng_and_m(k: u16, m: u8, rng: R) -> Result<Self, Error> {
        validate_k_m(k, m)?;
        Ok(Self {
            k,
            m,
            min_k: k,
            n: 0,
            is_level_zero_sorted: false,
            levels: vec![Vec::new()],
            min_item: None,
            max_item: None,
            read_only: false,
            is_direct: false,
            alloc: None,
            rng,
        })
    }

    /// Returns parameter k used to configure this sketch.
    pub fn k(&self) -> u16 {
        self.k
    }

    /// Returns parameter m (the minimum level fan-in) used to configure this
    /// sketch.
    pub fn m(&self) -> u8 {
        self.m
    }

    /// Returns the minimum k used when computing error bounds; this is the
    /// smallest k of any sketch that has ever contributed to this one via
    /// [`KllSketch::merge`].
    pub fn min_k(&self) -> u16 {
        self.min_k
    }

    /// Returns total weight of the stream.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Returns true if the sketch has not seen any data.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Returns the number of retained items.
    pub fn num_retained(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    /// Returns true if the sketch is in estimation mode, i.e. its error
    /// bounds are no longer zero because it has compacted at least once.
    pub fn is_estimation_mode(&self) -> bool {
        self.levels.len() > 1
    }

    /// Returns true if this sketch was constructed via [`KllSketch::wrap`]
    /// and therefore rejects all mutating calls.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true if this sketch's growth must clear an
    /// [`AllocationCallback`] (built via [`KllSketch::writable_wrap`]).
    pub fn is_direct(&self) -> bool {
        self.is_direct
    }

    /// Returns the minimum item seen by the sketch.
    pub fn min_item(&self) -> Option<&T> {
        self.min_item.as_ref()
    }

    /// Returns the maximum item seen by the sketch.
    pub fn max_item(&self) -> Option<&T> {
        self.max_item.as_ref()
    }

    /// Updates the sketch with a new item of unit weight.
    ///
    /// NaN values are silently ignored for floating-point types, matching
    /// the quantile literature's convention that NaN has no well-defined
    /// rank.
    pub fn update(&mut self, item: T) -> Result<(), Error> {
        self.check_mutable()?;
        if T::is_nan(&item) {
            return Ok(());
        }
        self.update_min_max(&item);
        self.internal_update(item)
    }

    /// Updates the sketch with a new item carrying an explicit integer
    /// weight, equivalent to (but far cheaper than) calling [`update`] on
    /// `weight` copies of `item`.
    ///
    /// [`update`]: KllSketch::update
    pub fn update_weighted(&mut self, item: T, weight: u64) -> Result<(), Error> {
        self.check_mutable()?;
        if weight == 0 {
            return Err(Error::invalid_argument("weight must be >= 1"));
        }
        if T::is_nan(&item) {
            return Ok(());
        }
        self.update_min_max(&item);

        let mut remaining = weight;
        let mut level = 0usize;
        while remaining > 0 {
            if remaining & 1 == 1 {
                self.ensure_level(level)?;
                if level == 0 {
                    self.levels[0].push(item.clone());
                    self.is_level_zero_sorted = false;
                } else {
                    let pos = self.levels[level]
                        .binary_search_by(|existing| T::cmp(existing, &item))
                        .unwrap_or_else(|insert_at| insert_at);
                    self.levels[level].insert(pos, item.clone());
                }
                self.compress_from(level)?;
            }
            remaining >>= 1;
            level += 1;
        }
        self.n += weight;
        Ok(())
    }

    /// Updates the sketch with every item of `items`, in order.
    pub fn update_many<I: IntoIterator<Item = T>>(&mut self, items: I) -> Result<(), Error> {
        for item in items {
            self.update(item)?;
        }
        Ok(())
    }

    /// Resets the sketch to empty, keeping its configured `k`/`m`.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.check_mutable()?;
        self.n = 0;
        self.min_k = self.k;
        self.is_level_zero_sorted = false;
        self.levels = vec![Vec::new()];
        self.min_item = None;
        self.max_item = None;
        Ok(())
    }

    /// Merges another sketch's data into this one.
    ///
    /// Because [`KllSketch`] is generic over its item type, merging two
    /// sketches over different element types (e.g. `KllSketch<f64>` and
    /// `KllSketch<i64>`) is rejected at compile time rather than at runtime:
    /// there is no `T` for which both `self` and `other` would type-check.
    /// Within a single `T`, only a mismatched `m` is rejected here, since `m`
    /// (unlike `k`) must agree exactly for the merged level weights to stay
    /// meaningful.
    pub fn merge(&mut self, other: &KllSketch<T, R>) -> Result<(), Error> {
        self.check_mutable()?;
        if other.is_empty() {
            return Ok(());
        }
        if self.m != other.m {
            return Err(Error::invalid_argument(format!(
                "incompatible m values: {} and {}",
                self.m, other.m
            )));
        }

        self.update_min_max_from_other(other);

        let final_n = self.n + other.n;
        for item in &other.levels[0] {
            self.internal_update(item.clone())?;
        }

        if other.levels.len() >= 2 {
            self.merge_higher_levels(other)?;
        }

        self.n = final_n;
        if other.is_estimation_mode() {
            self.min_k = self.min_k.min(other.min_k);
        }

        debug_assert_eq!(self.total_weight(), self.n, "total weight does not match n");
        Ok(())
    }

    /// Returns the normalized rank of `item`: the fraction of the stream
    /// estimated to compare less than (or, if `inclusive`, less than or
    /// equal to) it. Returns `None` if the sketch is empty.
    pub fn rank(&self, item: &T, inclusive: bool) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Some(view.rank(item, inclusive))
    }

    /// Lower bound of the error interval around [`rank`](KllSketch::rank).
    pub fn rank_lower_bound(&self, item: &T, inclusive: bool) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Some(view.rank_lower_bound(item, inclusive))
    }

    /// Upper bound of the error interval around [`rank`](KllSketch::rank).
    pub fn rank_upper_bound(&self, item: &T, inclusive: bool) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Some(view.rank_upper_bound(item, inclusive))
    }

    /// Returns the item at the given normalized rank (0.0 = minimum, 1.0 =
    /// maximum). Returns `Ok(None)` if the sketch is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if `rank` is not in `[0.0, 1.0]`.
    pub fn quantile(&self, rank: f64, inclusive: bool) -> Result<Option<T>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        check_rank(rank)?;
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(view.quantile(rank, inclusive)))
    }

    /// Batch form of [`quantile`](KllSketch::quantile).
    pub fn quantiles(&self, ranks: &[f64], inclusive: bool) -> Result<Option<Vec<T>>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        for &rank in ranks {
            check_rank(rank)?;
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(
            ranks.iter().map(|&rank| view.quantile(rank, inclusive)).collect(),
        ))
    }

    /// Lower bound of the error interval around
    /// [`quantile`](KllSketch::quantile).
    pub fn quantile_lower_bound(&self, rank: f64, inclusive: bool) -> Result<Option<T>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        check_rank(rank)?;
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(view.quantile_lower_bound(rank, inclusive)))
    }

    /// Upper bound of the error interval around
    /// [`quantile`](KllSketch::quantile).
    pub fn quantile_upper_bound(&self, rank: f64, inclusive: bool) -> Result<Option<T>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        check_rank(rank)?;
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(view.quantile_upper_bound(rank, inclusive)))
    }

    /// Returns the approximate CDF for the given split points: for each
    /// split point, the normalized rank of that point, plus a trailing 1.0.
    ///
    /// # Errors
    ///
    /// Returns an error if `split_points` contains NaN or is not strictly
    /// increasing.
    pub fn cdf(&self, split_points: &[T], inclusive: bool) -> Result<Option<Vec<f64>>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(view.cdf(split_points, inclusive)?))
    }

    /// Returns the approximate PMF (the successive differences of the CDF)
    /// for the given split points.
    pub fn pmf(&self, split_points: &[T], inclusive: bool) -> Result<Option<Vec<f64>>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        let view = build_sorted_view(&self.levels, self.min_k);
        Ok(Some(view.pmf(split_points, inclusive)?))
    }

    /// Returns the normalized rank error bound for this sketch's effective
    /// k. `pmf` selects the (slightly larger) bound for PMF buckets.
    pub fn normalized_rank_error(&self, pmf: bool) -> f64 {
        normalized_rank_error(self.min_k, pmf)
    }

    /// Iterates retained items in ascending order, each paired with the
    /// number of original stream items it represents.
    pub fn iter(&self) -> std::vec::IntoIter<(T, u64)> {
        let view = build_sorted_view(&self.levels, self.min_k);
        let items: Vec<(T, u64)> = view.iter().map(|(item, weight)| (item.clone(), weight)).collect();
        items.into_iter()
    }

    /// Serializes the sketch to the compact binary format (serial version 1
    /// or 2, matching the Apache DataSketches Java/C++ wire format).
    pub fn serialize(&self) -> Vec<u8> {
        let size = self.serialized_size_bytes();
        let mut bytes = SketchBytes::with_capacity(size);

        let is_empty = self.is_empty();
        let is_single_item = self.n == 1;

        let preamble_ints = if is_empty || is_single_item {
            PREAMBLE_INTS_SHORT
        } else {
            PREAMBLE_INTS_FULL
        };
        let serial_version = if is_single_item {
            SERIAL_VERSION_2
        } else {
            SERIAL_VERSION_1
        };

        let flags = (if is_empty { FLAG_EMPTY } else { 0 })
            | (if self.is_level_zero_sorted {
                FLAG_LEVEL_ZERO_SORTED
            } else {
                0
            })
            | (if is_single_item { FLAG_SINGLE_ITEM } else { 0 })
            | (if T::IS_DOUBLES { FLAG_DOUBLES_ELEMENT } else { 0 });

        bytes.write_u8(preamble_ints);
        bytes.write_u8(serial_version);
        bytes.write_u8(KLL_FAMILY_ID);
        bytes.write_u8(flags);
        bytes.write_u16_le(self.k);
        bytes.write_u8(self.m);
        bytes.write_u8(0);

        if is_empty {
            return bytes.into_bytes();
        }

        if !is_single_item {
            bytes.write_u64_le(self.n);
            bytes.write_u16_le(self.min_k);
            bytes.write_u8(self.levels.len() as u8);
            bytes.write_u8(0);

            let level_offsets = self.level_offsets();
            for offset in level_offsets.iter().take(self.levels.len()) {
                bytes.write_u32_le(*offset);
            }

            if let Some(min_item) = &self.min_item {
                T::serialize(min_item, &mut bytes);
            }
            if let Some(max_item) = &self.max_item {
                T::serialize(max_item, &mut bytes);
            }
        }

        for level in &self.levels {
            for item in level {
                T::serialize(item, &mut bytes);
            }
        }

        bytes.into_bytes()
    }

    /// Serializes the sketch to the updatable binary format (serial version
    /// 3): unlike [`serialize`](KllSketch::serialize), this always writes
    /// the full preamble and a trailing capacity entry in the levels array,
    /// so the result can be handed to [`KllSketch::writable_wrap`] and keep
    /// growing.
    pub fn serialize_updatable(&self) -> Vec<u8> {
        let size = self.serialized_size_updatable_bytes();
        let mut bytes = SketchBytes::with_capacity(size);

        let flags = (if self.is_empty() { FLAG_EMPTY } else { 0 })
            | (if self.is_level_zero_sorted {
                FLAG_LEVEL_ZERO_SORTED
            } else {
                0
            })
            | (if T::IS_DOUBLES { FLAG_DOUBLES_ELEMENT } else { 0 })
            | FLAG_UPDATABLE;

        bytes.write_u8(PREAMBLE_INTS_FULL);
        bytes.write_u8(SERIAL_VERSION_3);
        bytes.write_u8(KLL_FAMILY_ID);
        bytes.write_u8(flags);
        bytes.write_u16_le(self.k);
        bytes.write_u8(self.m);
        bytes.write_u8(0);
        bytes.write_u64_le(self.n);
        bytes.write_u16_le(self.min_k);
        bytes.write_u8(self.levels.len() as u8);
        bytes.write_u8(0);

        for offset in self.level_offsets() {
            bytes.write_u32_le(offset);
        }

        if let Some(min_item) = &self.min_item {
            T::serialize(min_item, &mut bytes);
        }
        if let Some(max_item) = &self.max_item {
            T::serialize(max_item, &mut bytes);
        }

        for level in &self.levels {
            for item in level {
                T::serialize(item, &mut bytes);
            }
        }

        bytes.into_bytes()
    }

    /// Exact serialized length in bytes of [`serialize`](KllSketch::serialize)'s
    /// output for the sketch's current contents.
    pub fn serialized_size_bytes(&self) -> usize {
        if self.is_empty() {
            return EMPTY_SIZE_BYTES;
        }
        if self.n == 1 {
            let item = self
                .levels
                .iter()
                .flatten()
                .next()
                .expect("n == 1 implies exactly one retained item");
            return DATA_START_SINGLE_ITEM + T::serialized_size(item);
        }

        let mut size = DATA_START + self.levels.len() * 4;
        if let Some(min_item) = &self.min_item {
            size += T::serialized_size(min_item);
        }
        if let Some(max_item) = &self.max_item {
            size += T::serialized_size(max_item);
        }
        for level in &self.levels {
            for item in level {
                size += T::serialized_size(item);
            }
        }
        size
    }

    /// Exact serialized length in bytes of
    /// [`serialize_updatable`](KllSketch::serialize_updatable)'s output.
    pub fn serialized_size_updatable_bytes(&self) -> usize {
        let mut size = DATA_START + (self.levels.len() + 1) * 4;
        if let Some(min_item) = &self.min_item {
            size += T::serialized_size(min_item);
        }
        if let Some(max_item) = &self.max_item {
            size += T::serialized_size(max_item);
        }
        for level in &self.levels {
            for item in level {
                size += T::serialized_size(item);
            }
        }
        size
    }

    fn decode(bytes: &[u8], expect_updatable: bool) -> Result<Self, Error>
    where
        R: Default,
    {
        fn make_error(tag: &'static str) -> impl FnOnce(std::io::Error) -> Error {
            move |_| Error::insufficient_data(tag)
        }

        let mut cursor = SketchSlice::new(bytes);

        let preamble_ints = cursor.read_u8().map_err(make_error("preamble_ints"))?;
        let serial_version = cursor.read_u8().map_err(make_error("serial_version"))?;
        let family_id = cursor.read_u8().map_err(make_error("family_id"))?;
        let flags = cursor.read_u8().map_err(make_error("flags"))?;
        let k = cursor.read_u16_le().map_err(make_error("k"))?;
        let m = cursor.read_u8().map_err(make_error("m"))?;
        let _unused = cursor.read_u8().map_err(make_error("unused"))?;

        if family_id != KLL_FAMILY_ID {
            return Err(Error::invalid_family(KLL_FAMILY_ID, family_id, "KLL"));
        }
        validate_k_m(k, m).map_err(|e| Error::deserial(e.message().to_string()))?;

        match serial_version {
            SERIAL_VERSION_1 | SERIAL_VERSION_2 => {
                if expect_updatable {
                    return Err(Error::unsupported_serial_version(
                        SERIAL_VERSION_3,
                        serial_version,
                    ));
                }
                Self::decode_compact(cursor, preamble_ints, serial_version, flags, k, m)
            }
            SERIAL_VERSION_3 => {
                if !expect_updatable {
                    return Err(Error::deserial(
                        "use writable_wrap to decode an updatable-format sketch",
                    ));
                }
                Self::decode_updatable(cursor, preamble_ints, flags, k, m)
            }
            other => Err(Error::unsupported_serial_version(SERIAL_VERSION_1, other)),
        }
    }

    fn decode_compact(
        mut cursor: SketchSlice<'_>,
        preamble_ints: u8,
        serial_version: u8,
        flags: u8,
        k: u16,
        m: u8,
    ) -> Result<Self, Error>
    where
        R: Default,
    {
        fn make_error(tag: &'static str) -> impl FnOnce(std::io::Error) -> Error {
            move |_| Error::insufficient_data(tag)
        }

        let is_empty = (flags & FLAG_EMPTY) != 0;
        let is_single_item = (flags & FLAG_SINGLE_ITEM) != 0;
        let is_level_zero_sorted = (flags & FLAG_LEVEL_ZERO_SORTED) != 0;

        if is_empty || is_single_item {
            if preamble_ints != PREAMBLE_INTS_SHORT {
                return Err(Error::invalid_preamble_longs(PREAMBLE_INTS_SHORT, preamble_ints));
            }
        } else if preamble_ints != PREAMBLE_INTS_FULL {
            return Err(Error::invalid_preamble_longs(PREAMBLE_INTS_FULL, preamble_ints));
        }

        if is_single_item && serial_version != SERIAL_VERSION_2 {
            return Err(Error::unsupported_serial_version(SERIAL_VERSION_2, serial_version));
        }
        if !is_single_item && serial_version != SERIAL_VERSION_1 {
            return Err(Error::unsupported_serial_version(SERIAL_VERSION_1, serial_version));
        }

        if is_empty {
            return Ok(Self::from_parts(k, m, k, 0, vec![Vec::new()], None, None, is_level_zero_sorted));
        }

        let (n, min_k, num_levels) = if is_single_item {
            (1u64, k, 1usize)
        } else {
            let n = cursor.read_u64_le().map_err(make_error("n"))?;
            let min_k = cursor.read_u16_le().map_err(make_error("min_k"))?;
            let num_levels = cursor.read_u8().map_err(make_error("num_levels"))?;
            let _unused = cursor.read_u8().map_err(make_error("unused2"))?;
            (n, min_k, num_levels as usize)
        };

        if num_levels == 0 {
            return Err(Error::deserial("num_levels must be > 0"));
        }
        if min_k < m as u16 || min_k > k {
            return Err(Error::deserial(format!(
                "min_k must be in [{m}, {k}], got {min_k}"
            )));
        }

        let capacity = compute_total_capacity(k, m, num_levels);
        let mut level_offsets = Vec::with_capacity(num_levels + 1);
        if !is_single_item {
            for _ in 0..num_levels {
                let offset = cursor.read_u32_le().map_err(make_error("levels"))?;
                level_offsets.push(offset);
            }
        } else {
            level_offsets.push(capacity - 1);
        }
        level_offsets.push(capacity);

        validate_level_offsets(&level_offsets, capacity)?;

        let min_item = if is_single_item {
            None
        } else {
            Some(T::deserialize(&mut cursor)?)
        };
        let max_item = if is_single_item {
            None
        } else {
            Some(T::deserialize(&mut cursor)?)
        };

        let mut levels = Vec::with_capacity(num_levels);
        for level in 0..num_levels {
            let size = (level_offsets[level + 1] - level_offsets[level]) as usize;
            let mut items = Vec::with_capacity(size);
            for _ in 0..size {
                items.push(T::deserialize(&mut cursor)?);
            }
            levels.push(items);
        }

        let mut sketch = Self::from_parts(k, m, min_k, n, levels, min_item, max_item, is_level_zero_sorted);

        if is_single_item {
            if let Some(item) = sketch.levels[0].first().cloned() {
                sketch.min_item = Some(item.clone());
                sketch.max_item = Some(item);
            }
        }

        Ok(sketch)
    }

    fn decode_updatable(
        mut cursor: SketchSlice<'_>,
        preamble_ints: u8,
        flags: u8,
        k: u16,
        m: u8,
    ) -> Result<Self, Error>
    where
        R: Default,
    {
        fn make_error(tag: &'static str) -> impl FnOnce(std::io::Error) -> Error {
            move |_| Error::insufficient_data(tag)
        }

        if preamble_ints != PREAMBLE_INTS_FULL {
            return Err(Error::invalid_preamble_longs(PREAMBLE_INTS_FULL, preamble_ints));
        }

        let is_empty = (flags & FLAG_EMPTY) != 0;
        let is_level_zero_sorted = (flags & FLAG_LEVEL_ZERO_SORTED) != 0;

        let n = cursor.read_u64_le().map_err(make_error("n"))?;
        let min_k = cursor.read_u16_le().map_err(make_error("min_k"))?;
        let num_levels = cursor.read_u8().map_err(make_error("num_levels"))? as usize;
        let _unused = cursor.read_u8().map_err(make_error("unused2"))?;

        if num_levels == 0 {
            return Err(Error::deserial("num_levels must be > 0"));
        }
        if min_k < m as u16 || min_k > k {
            return Err(Error::deserial(format!(
                "min_k must be in [{m}, {k}], got {min_k}"
            )));
        }

        let capacity = compute_total_capacity(k, m, num_levels);
        let mut level_offsets = Vec::with_capacity(num_levels + 1);
        for _ in 0..=num_levels {
            let offset = cursor.read_u32_le().map_err(make_error("levels"))?;
            level_offsets.push(offset);
        }
        validate_level_offsets(&level_offsets, capacity)?;

        let (min_item, max_item) = if is_empty {
            (None, None)
        } else {
            (Some(T::deserialize(&mut cursor)?), Some(T::deserialize(&mut cursor)?))
        };

        let mut levels = Vec::with_capacity(num_levels);
        for level in 0..num_levels {
            let size = (level_offsets[level + 1] - level_offsets[level]) as usize;
            let mut items = Vec::with_capacity(size);
            for _ in 0..size {
                items.push(T::deserialize(&mut cursor)?);
            }
            levels.push(items);
        }

        Ok(Self::from_parts(k, m, min_k, n, levels, min_item, max_item, is_level_zero_sorted))
    }

    fn from_parts(
        k: u16,
        m: u8,
        min_k: u16,
        n: u64,
        levels: Vec<Vec<T>>,
        min_item: Option<T>,
        max_item: Option<T>,
        is_level_zero_sorted: bool,
    ) -> Self
    where
        R: Default,
    {
        Self {
            k,
            m,
            min_k,
            n,
            is_level_zero_sorted,
            levels,
            min_item,
            max_item,
            read_only: false,
            is_direct: false,
            alloc: None,
            rng: R::default(),
        }
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::invalid_argument(
                "sketch is read-only (constructed via KllSketch::wrap)",
            ));
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        compute_total_capacity(self.k, self.m, self.levels.len()) as usize
    }

    fn level_offsets(&self) -> Vec<u32> {
        let capacity = self.capacity() as u32;
        let retained = self.num_retained() as u32;
        let mut offsets = Vec::with_capacity(self.levels.len() + 1);
        let mut offset = capacity.saturating_sub(retained);
        offsets.push(offset);
        for level in &self.levels {
            offset += level.len() as u32;
            offsets.push(offset);
        }
        offsets
    }

    fn update_min_max(&mut self, item: &T) {
        match self.min_item.as_ref() {
            None => {
                self.min_item = Some(item.clone());
                self.max_item = Some(item.clone());
            }
            Some(min) => {
                if T::cmp(item, min) == Ordering::Less {
                    self.min_item = Some(item.clone());
                }
                if let Some(max) = &self.max_item {
                    if T::cmp(max, item) == Ordering::Less {
                        self.max_item = Some(item.clone());
                    }
                }
            }
        }
    }

    fn update_min_max_from_other(&mut self, other: &KllSketch<T, R>) {
        match (&self.min_item, &self.max_item) {
            (None, None) => {
                self.min_item = other.min_item.clone();
                self.max_item = other.max_item.clone();
            }
            (Some(min), Some(max)) => {
                if let Some(other_min) = &other.min_item {
                    if T::cmp(other_min, min) == Ordering::Less {
                        self.min_item = Some(other_min.clone());
                    }
                }
                if let Some(other_max) = &other.max_item {
                    if T::cmp(max, other_max) == Ordering::Less {
                        self.max_item = Some(other_max.clone());
                    }
                }
            }
            _ => {
                self.min_item = other.min_item.clone();
                self.max_item = other.max_item.clone();
            }
        }
    }

    fn internal_update(&mut self, item: T) -> Result<(), Error> {
        if self.num_retained() >= self.capacity() {
            self.compress_while_updating()?;
        }
        self.n += 1;
        self.is_level_zero_sorted = false;
        self.levels[0].insert(0, item);
        Ok(())
    }

    fn ensure_level(&mut self, level: usize) -> Result<(), Error> {
        while self.levels.len() <= level {
            let k = self.k;
            let m = self.m;
            let is_direct = self.is_direct;
            compactor::grow_one_level(&mut self.levels, k, m, self.alloc.as_deref_mut(), is_direct)?;
        }
        Ok(())
    }

    fn compress_from(&mut self, level: usize) -> Result<(), Error> {
        let k = self.k;
        let m = self.m;
        let is_direct = self.is_direct;
        compactor::compact_from(
            &mut self.levels,
            level,
            k,
            m,
            &mut self.rng,
            &mut self.is_level_zero_sorted,
            self.alloc.as_deref_mut(),
            is_direct,
        )
    }

    fn compress_while_updating(&mut self) -> Result<(), Error> {
        let level = self.find_level_to_compact().ok_or_else(|| {
            Error::invalid_argument("no level eligible for compaction despite being at capacity")
        })?;
        self.compress_from(level)
    }

    fn find_level_to_compact(&self) -> Option<usize> {
        let num_levels = self.levels.len();
        for level in 0..num_levels {
            let pop = self.levels[level].len() as u32;
            let cap = level_capacity(self.k, num_levels, level, self.m);
            if pop >= cap {
                return Some(level);
            }
        }
        None
    }

    fn merge_higher_levels(&mut self, other: &KllSketch<T, R>) -> Result<(), Error> {
        let provisional_levels = self.levels.len().max(other.levels.len());
        let mut self_levels = std::mem::take(&mut self.levels);
        let mut work_levels = vec![Vec::new(); provisional_levels];
        work_levels[0] = std::mem::take(&mut self_levels[0]);

        for level in 1..provisional_levels {
            let left = if level < self_levels.len() {
                std::mem::take(&mut self_levels[level])
            } else {
                Vec::new()
            };
            let right = other.levels.get(level).cloned().unwrap_or_default();

            work_levels[level] = if left.is_empty() {
                right
            } else if right.is_empty() {
                left
            } else {
                compactor::merge_sorted_vec(left, right)
            };
        }

        let k = self.k;
        let m = self.m;
        let is_direct = self.is_direct;
        let sorted = self.is_level_zero_sorted;
        self.levels = compactor::general_compress(
            work_levels,
            k,
            m,
            &mut self.rng,
            sorted,
            self.alloc.as_deref_mut(),
            is_direct,
        )?;
        Ok(())
    }

    fn total_weight(&self) -> u64 {
        let sizes: Vec<usize> = self.levels.iter().map(|level| level.len()).collect();
        sum_the_sample_weights(&sizes)
    }
}

/// Validates `k`/`m` against the accepted parameter space: `m` must be `4`
/// or an even number `>= 8`, and `k` must be in `[m, MAX_K]`.
fn validate_k_m(k: u16, m: u8) -> Result<(), Error> {
    let m_valid = m == 4 || (m >= 8 && m % 2 == 0);
    if !m_valid {
        return Err(Error::invalid_argument(format!(
            "m must be 4 or an even number >= 8, got {m}"
        )));
    }
    if k < m as u16 || k > MAX_K {
        return Err(Error::invalid_argument(format!(
            "k must be in [{m}, {MAX_K}], got {k}"
        )));
    }
    Ok(())
}

fn check_rank(rank: f64) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&rank) {
        return Err(Error::invalid_argument(format!(
            "rank must be in [0.0, 1.0], got {rank}"
        )));
    }
    Ok(())
}

fn validate_level_offsets(level_offsets: &[u32], capacity: u32) -> Result<(), Error> {
    if level_offsets.is_empty() {
        return Err(Error::deserial("levels array is empty"));
    }
    if level_offsets[0] > capacity {
        return Err(Error::deserial("levels[0] exceeds capacity"));
    }
    for window in level_offsets.windows(2) {
        if window[1] < window[0] {
            return Err(Error::deserial("levels array must be non-decreasing"));
        }
    }
    let last = *level_offsets.last().expect("checked non-empty above");
    if last != capacity {
        return Err(Error::deserial("levels last offset must equal capacity"));
    }
    Ok(())
}
