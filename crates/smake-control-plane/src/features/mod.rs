pub mod instance_store;
pub mod lifecycle;
pub mod observability;
pub mod pool;
