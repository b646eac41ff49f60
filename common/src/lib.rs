pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod record;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
