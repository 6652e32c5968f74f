pub mod processor;
pub mod queue;
pub mod session;
pub mod storage;
pub mod sweeper;
