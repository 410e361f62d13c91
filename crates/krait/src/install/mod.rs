//! Linking, unlinking and transaction execution.

pub mod driver;
pub mod link;
pub mod unlink;

pub use link::{link_package, LinkError};
pub use unlink::{unlink_package, UnlinkError};
