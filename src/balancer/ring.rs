// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotating ring of endpoints.
//!
//! Index-based rather than pointer-linked: a vector plus a cursor gives the
//! same O(1) rotation and tail insert, with removal keeping the contract that
//! the cursor lands on the removed endpoint's successor.

use std::sync::Arc;

use super::Endpoint;

#[derive(Debug, Default)]
pub(crate) struct Ring {
    nodes: Vec<Arc<Endpoint>>,
    cursor: usize,
}

impl Ring {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append at the tail. An empty ring becomes a single-element ring whose
    /// head, tail and cursor all point at the new endpoint.
    pub(crate) fn push(&mut self, endpoint: Arc<Endpoint>) {
        self.nodes.push(endpoint);
    }

    pub(crate) fn head(&self) -> Option<&Arc<Endpoint>> {
        self.nodes.first()
    }

    pub(crate) fn tail(&self) -> Option<&Arc<Endpoint>> {
        self.nodes.last()
    }

    /// The endpoint under the cursor, without moving it.
    pub(crate) fn current(&self) -> Option<&Arc<Endpoint>> {
        self.nodes.get(self.cursor)
    }

    /// The cursor's successor, without moving the cursor. In a single-element
    /// ring this is the current endpoint itself.
    pub(crate) fn peek_next(&self) -> Option<&Arc<Endpoint>> {
        if self.nodes.is_empty() {
            return None;
        }
        self.nodes.get((self.cursor + 1) % self.nodes.len())
    }

    /// The cursor's predecessor, without moving the cursor.
    pub(crate) fn peek_prev(&self) -> Option<&Arc<Endpoint>> {
        if self.nodes.is_empty() {
            return None;
        }
        self.nodes
            .get((self.cursor + self.nodes.len() - 1) % self.nodes.len())
    }

    /// Return the current endpoint and advance the cursor one step.
    pub(crate) fn rotate(&mut self) -> Option<Arc<Endpoint>> {
        if self.nodes.is_empty() {
            return None;
        }
        let current = self.nodes[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.nodes.len();
        Some(current)
    }

    /// Return the current endpoint and move the cursor one step back.
    pub(crate) fn rotate_back(&mut self) -> Option<Arc<Endpoint>> {
        if self.nodes.is_empty() {
            return None;
        }
        let current = self.nodes[self.cursor].clone();
        self.cursor = (self.cursor + self.nodes.len() - 1) % self.nodes.len();
        Some(current)
    }

    /// Remove an endpoint by identity. If it was under the cursor, the cursor
    /// moves to its successor; removing the last element empties the ring.
    pub(crate) fn remove(&mut self, endpoint: &Arc<Endpoint>) -> bool {
        let Some(index) = self.nodes.iter().position(|e| e.id() == endpoint.id()) else {
            return false;
        };
        self.nodes.remove(index);
        if self.nodes.is_empty() {
            self.cursor = 0;
        } else if index < self.cursor {
            self.cursor -= 1;
        } else if self.cursor >= self.nodes.len() {
            self.cursor = 0;
        }
        true
    }

    pub(crate) fn contains(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.nodes.iter().any(|e| e.id() == endpoint.id())
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.cursor = 0;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.nodes.iter()
    }
}
