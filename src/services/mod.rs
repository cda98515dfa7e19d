// Services module - cluster orchestration and etcd maintenance
pub mod cluster;
pub mod etcd;
pub mod templates;

pub use cluster::ClusterManager;
pub use etcd::EtcdManager;
