//! Helpers shared by the crate's unit tests.
//!
//! The socket guard is the same file the integration tests use.

#[path = "../../tests/support/socket_guard.rs"]
#[allow(dead_code)]
pub(crate) mod socket_guard;
