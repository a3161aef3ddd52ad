// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
///
/// Only resource shortages and permission/lookup misses are reported through
/// this type; broken internal invariants panic instead of returning.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Invalid arguments provided.
    InvalidArgs,
    /// Insufficient memory available for a table page or reverse-map entry.
    NoMemory,
    /// The address has no valid translation.
    PageFault,
    /// The translation exists but does not grant the requested access.
    AccessDenied,
    /// Not enough TLB1 slots to satisfy the request.
    NotEnoughResources,
}
