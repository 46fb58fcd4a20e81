//! Host session identity lookup for execution-time revalidation.
//!
//! Cross-thread and delayed callbacks must never close over a live host
//! resource (a connected session, a player handle): by the time they run, the
//! resource may be gone. The pattern enforced here is to capture only a
//! stable [`SessionId`] and resolve the live handle from the host-supplied
//! directory at execution time, on the thread that will touch it.

use uuid::Uuid;

/// Stable identity key for a host session. Safe to capture in delayed and
/// cross-thread callbacks; never dangles.
pub type SessionId = Uuid;

/// Host-supplied lookup from a stable identity to a live handle.
///
/// Implementations are queried on the host loop thread immediately before a
/// guarded task runs (see [`crate::core::Scheduler::run_if_present`]), never
/// at capture time. Returning `None` means the session is gone and the
/// guarded task is skipped.
pub trait SessionLookup: Send + Sync + 'static {
    /// The live handle type the host resolves identities to.
    type Handle;

    /// Resolve `id` to a live handle, or `None` if the session no longer
    /// exists.
    fn resolve(&self, id: SessionId) -> Option<Self::Handle>;
}
