//! Standard memory orderings for concurrent node access.
//!
//! These constants keep ordering usage consistent across the crate and make
//! the intent visible at each access point. Optimistic readers pair their
//! `Acquire` loads with the `Release` stores writers issue while unlocking.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during optimistic traversal.
/// Pairs with a writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields from under a lock.
/// Pairs with a reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for a successful lock-word CAS.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for a failed lock-word CAS. Only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads inside a locked region.
/// The lock acquisition already provides the synchronization edge.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the root pointer swap on grow/shrink.
pub const ROOT_CAS: Ordering = Ordering::AcqRel;
