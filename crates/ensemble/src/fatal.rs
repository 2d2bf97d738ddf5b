//! Unrecoverable invariant violations.

/// Log an invariant violation and abort the process.
///
/// Used where continuing would let two nodes act on the same instance or
/// silently drop accepted messages.
pub fn invariant_violated(what: &str) -> ! {
    tracing::error!(invariant = what, "invariant violated, aborting");
    std::process::abort()
}
