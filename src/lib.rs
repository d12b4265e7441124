//! samwal - a transactional metadata log for block devices
//!
//! Filesystem metadata changes are declared as byte-range deltas, made
//! durable together by one commit record per epoch, and rolled to their
//! master devices in the background. After a crash, mounting the log
//! replays every committed epoch and discards the rest.

pub mod cli;
pub mod crash_point;
pub mod device;
pub mod log;
pub mod observability;
