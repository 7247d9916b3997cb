//! Repository implementations for database operations.

mod bean_repo;
mod consumer_repo;

pub use bean_repo::{BeanKind, BeanRepository};
pub use consumer_repo::ConsumerRepository;
