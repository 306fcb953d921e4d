//! Domain entity models.

pub mod claim;
pub mod request;
pub mod session;
