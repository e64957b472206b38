//! Signed webhook notifications

pub mod dispatcher;
pub mod signing;

pub use dispatcher::{Delivery, NotificationDispatcher, ARTIFACT_PUBLISHED};
pub use signing::{canonical_bytes, sign, verify, SIGNATURE_HEADER};
