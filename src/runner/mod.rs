pub mod cancel;
pub mod config;
pub mod context;
pub mod discovery;
pub mod display;
pub mod execution;
pub mod executor;
pub mod filter;
pub mod pool;
pub mod registration;
pub mod report;
pub mod result;
