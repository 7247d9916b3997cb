//! Core domain types for the bean queue system.
//!
//! This crate contains shared types used across all packages:
//! - Bean and Status for task descriptors
//! - ConsumerStatus, QueueSnapshot and ConsumerInfo for queues
//! - CommandBean and Acknowledgement for the command channel
//! - Events for status listeners

mod bean;
mod command;
mod events;
mod queue;

pub use bean::{Bean, BeanId, ParseStatusError, Status};
pub use command::{Acknowledgement, CommandBean, CommandId, CommandOutcome, QueueCommand};
pub use events::ConsumerEvent;
pub use queue::{ConsumerId, ConsumerInfo, ConsumerStatus, QueueSnapshot};
