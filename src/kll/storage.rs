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

//! Growth hook for sketches backed by externally managed memory.
//!
//! A [`KllSketch`](crate::kll::KllSketch) built through [`KllSketch::new`] or
//! [`KllSketch::deserialize`] grows its levels on the ordinary Rust heap and
//! never needs this trait. A sketch built through
//! [`KllSketch::writable_wrap`] is instead backed by a region the caller owns
//! out-of-band (for example a memory-mapped file or an arena shared with
//! other sketches); such a sketch has no implicit way to ask that owner for
//! more room, so every growth is routed through an `AllocationCallback` the
//! caller provides up front.
//!
//! This crate forbids `unsafe_code`, so a direct sketch's retained items
//! still live in ordinary `Vec<T>`s on the Rust heap; `AllocationCallback`
//! is the admission check the caller's external accounting requires before
//! that growth is allowed to happen, not the storage itself. An
//! implementation should reserve `num_items` worth of room in whatever
//! external ledger it tracks and fail the call if that budget is exceeded;
//! it reports success or failure only, never a buffer.

use crate::error::Error;

/// Gates growth for a sketch that tracks its budget in an external ledger.
pub trait AllocationCallback {
    /// Requests room for at least `num_items` retained items, reserving that
    /// much space against whatever external budget this callback tracks.
    ///
    /// Implementations that cannot satisfy the request should return an
    /// error, which the sketch surfaces as
    /// [`ErrorKind::OutOfCapacity`](crate::error::ErrorKind::OutOfCapacity).
    fn request(&mut self, num_items: usize) -> Result<(), Error>;
}

/// An [`AllocationCallback`] backed by a fixed-size pool, useful for tests
/// and for callers who want to cap how large a direct sketch may grow.
pub struct FixedCapacityAllocator {
    max_items: usize,
}

impl FixedCapacityAllocator {
    /// Creates a callback that refuses any request above `max_items`.
    pub fn new(max_items: usize) -> Self {
        Self { max_items }
    }
}

impl AllocationCallback for FixedCapacityAllocator {
    fn request(&mut self, num_items: usize) -> Result<(), Error> {
        if num_items > self.max_items {
            return Err(Error::out_of_capacity(format!(
                "requested {num_items} items but pool is capped at {}",
                self.max_items
            )));
        }
        Ok(())
    }
}
