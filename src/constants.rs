//! Application-wide constants.
//!
//! Timeouts, limits and protocol identifiers used by more than one module.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Request timeout for Matrix Client-Server API calls.
pub const MATRIX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single image download.
pub const DEFAULT_IMAGE_FETCH_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Relay
// ============================================================================

/// Capacity of the payload channel between the Gotify source and the relay.
///
/// The source waits when the relay falls this far behind.
pub const PAYLOAD_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Megolm session rotation
// ============================================================================

/// Messages encrypted with one outbound group session before it expires.
pub const DEFAULT_ROTATION_MESSAGES: u64 = 100;

/// Lifetime of an outbound group session (one week).
pub const DEFAULT_ROTATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Number of one-time keys published with the device keys.
pub const ONE_TIME_KEY_COUNT: usize = 50;

// ============================================================================
// Matrix identifiers
// ============================================================================

/// Megolm room encryption algorithm.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Olm to-device encryption algorithm.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Display name given to the device at login.
pub const DEVICE_DISPLAY_NAME: &str = "gotify-matrix-relay";
