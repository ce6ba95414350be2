//! Default constants for claimguard configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Scanning Defaults
// =============================================================================

/// Minimum interval between two member scans of the same partition (ms).
/// The scanner is invoked every host tick; most invocations return early.
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 1000;

// =============================================================================
// Bootstrap Defaults
// =============================================================================

/// Cadence of the periodic sweep/discover pass over loaded partitions (s).
/// Coarser than the scanner; it is the safety net, not the primary path.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

// =============================================================================
// Guard Defaults
// =============================================================================

/// Suppression id stamped on guards. Must exist on the host, which ships it
/// by default.
pub const DEFAULT_SUPPRESSION_ID: &str = "Spawn_Camp";

/// Prefix of the attribution marker; the owner uuid follows it.
pub const DEFAULT_MARKER_PREFIX: &str = "ClaimGuard:";

// =============================================================================
// Flush Defaults
// =============================================================================

/// Requests handled per queue per flush. 0 drains each queue completely.
pub const DEFAULT_MAX_FLUSH_BATCH: usize = 0;

/// Prefix for environment overrides, e.g. `CLAIMGUARD_SCAN_INTERVAL_MS=250`.
pub const ENV_PREFIX: &str = "CLAIMGUARD_";
