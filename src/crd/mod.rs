//! Custom Resource Definitions read by the reconciler
//!
//! Only the NodeGroup resource is modelled; Nodes and the checksum Secret
//! use the core `k8s-openapi` types.

mod node_group;
pub mod types;


pub use node_group::{NodeGroup, NodeGroupSpec, NodeGroupStatus};
pub use types::*;
