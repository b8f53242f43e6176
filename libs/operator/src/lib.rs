pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod zk;
pub mod zookeeper;
