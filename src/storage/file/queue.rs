//! Pending Operation Queue
//!
//! This module holds operations that have been submitted but not yet
//! admitted. Submission order is the admission priority: the dispatch loop
//! scans front to back and may take a later operation out of the middle when
//! an earlier one is blocked.
//!
//! The queue is owned by the scheduler task, so no locking is involved.

use std::collections::VecDeque;

use super::operations::{FileOperation, OperationId};

#[derive(Debug, Default)]
pub struct PendingQueue {
    /// Operations in submission order
    ops: VecDeque<FileOperation>,

    /// Identifier handed to the next submitted operation
    next_operation_id: OperationId,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation and returns the id it was assigned.
    pub fn push(&mut self, mut operation: FileOperation) -> OperationId {
        let id = self.next_operation_id;
        self.next_operation_id += 1;
        operation.id = id;
        self.ops.push_back(operation);
        id
    }

    pub fn get(&self, index: usize) -> Option<&FileOperation> {
        self.ops.get(index)
    }

    /// Removes the operation at `index`, keeping the order of the rest.
    pub fn remove(&mut self, index: usize) -> Option<FileOperation> {
        self.ops.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileOperation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Gets the next operation ID that will be assigned
    /// (useful for testing and debugging)
    pub fn next_operation_id(&self) -> OperationId {
        self.next_operation_id
    }
}
