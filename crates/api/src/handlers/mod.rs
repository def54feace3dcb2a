pub mod agent;
pub mod health;
pub mod rpc;
pub mod task;
