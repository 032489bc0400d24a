// Path: crates/master/src/jobs/mod.rs
//! Job cache and returner backends.

pub mod cache;
pub mod local;
pub mod returner;

pub use cache::{JobCache, ReturnDisposition};
pub use local::LocalCacheReturner;
pub use returner::Returner;
