pub mod kubeconfig;
mod status;
mod tracker;

pub use status::{patch_annotations, patch_status};
pub use tracker::{ClusterTracker, RemoteCluster, TrackerError};

#[cfg(test)]
pub(crate) use tracker::tests::offline_client;
