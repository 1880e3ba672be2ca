pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod server;
pub mod shutdown;
pub mod storage;

pub use config::{BrokerConfig, TierOrder};
pub use error::{BrokerError, Result, ValidationError};
pub use job::Job;
pub use manager::{Manager, PromotionReport};
pub use server::Broker;
pub use storage::{MemoryStore, Queue, SortedSet, Store};
