//! Node-partitioned primary key allocation.
//!
//! A key is `(node_id << counter_bits) | counter`. Every node owns the
//! partition of keys whose high bits equal its node id, so keys allocated
//! offline on different nodes never collide.

use crate::error::{CoreError, CoreResult};
use crate::types::{NodeId, TableId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::RangeInclusive;

/// Allocates primary keys inside this node's partition.
#[derive(Debug)]
pub struct PrimaryKeyManager {
    node_id: NodeId,
    counter_bits: u32,
    counters: Mutex<HashMap<TableId, i64>>,
}

impl PrimaryKeyManager {
    /// Creates a manager for `node_id`.
    ///
    /// # Errors
    ///
    /// Fails if `counter_bits` is outside `1..=62` or the node id does not
    /// fit in the remaining bits.
    pub fn new(node_id: NodeId, counter_bits: u32) -> CoreResult<Self> {
        Self::check_counter_bits(counter_bits)?;
        let max = Self::max_node_id(counter_bits);
        if node_id < 1 || node_id > max {
            return Err(CoreError::invalid_operation(format!(
                "node id {node_id} outside 1..={max} for {counter_bits} counter bits"
            )));
        }
        Ok(Self {
            node_id,
            counter_bits,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Fails unless `counter_bits` is in `1..=62`.
    pub fn check_counter_bits(counter_bits: u32) -> CoreResult<()> {
        if (1..=62).contains(&counter_bits) {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "counter bits must be in 1..=62, got {counter_bits}"
            )))
        }
    }

    /// Largest node id usable with `counter_bits` (0 if none is).
    pub fn max_node_id(counter_bits: u32) -> NodeId {
        i64::MAX.checked_shr(counter_bits).unwrap_or(0)
    }

    fn base(&self) -> i64 {
        self.node_id << self.counter_bits
    }

    fn max_counter(&self) -> i64 {
        (1i64 << self.counter_bits) - 1
    }

    /// The keys this node may allocate.
    pub fn partition(&self) -> RangeInclusive<i64> {
        self.base() + 1..=self.base() + self.max_counter()
    }

    /// Returns true if `key` lies in this node's partition.
    pub fn owns(&self, key: i64) -> bool {
        self.partition().contains(&key)
    }

    /// Allocates the next key for `table_id`.
    ///
    /// # Errors
    ///
    /// `PrimaryKeyExhausted` once the partition is used up.
    pub fn next_key(&self, table_id: TableId) -> CoreResult<i64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(table_id).or_insert(0);
        if *counter >= self.max_counter() {
            return Err(CoreError::PrimaryKeyExhausted { table_id });
        }
        *counter += 1;
        Ok(self.base() | *counter)
    }

    /// Advances the counter of `table_id` past `existing` if this node owns it.
    pub fn observe_existing(&self, table_id: TableId, existing: i64) {
        if !self.owns(existing) {
            return;
        }
        let used = existing - self.base();
        let mut counters = self.counters.lock();
        let counter = counters.entry(table_id).or_insert(0);
        if used > *counter {
            *counter = used;
        }
    }
}
