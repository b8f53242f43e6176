pub mod servicemonitor;
pub mod zookeepercluster;
