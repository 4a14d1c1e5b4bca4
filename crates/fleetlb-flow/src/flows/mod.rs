//! The flow library.
//!
//! Flow builders compose tasks from [`crate::tasks`] into the lifecycle
//! workflows. Builders are pure: they take the controller configuration (and,
//! for failover, the failed amphora) and return a [`crate::flow::Flow`] whose
//! shape is fixed before anything runs.
//!
//! | Builder | Seeded with |
//! |---------|-------------|
//! | [`create_amphora_flow`] | nothing |
//! | [`get_amphora_for_lb_subflow`] | `loadbalancer_id` |
//! | [`failover_amphora_flow`] | `failed_amphora_id`, plus `loadbalancer_id` for allocated amphorae |
//! | [`delete_amphora_flow`] | `amphora_id` |
//! | [`cert_rotate_amphora_flow`] | `amphora_id` |
//! | [`spare_fill_flow`] | nothing |
//! | [`create_cluster_flow`] | `loadbalancer_id` |
//! | [`create_cluster_amphorae_flow`] | `loadbalancer_id` |
//! | [`finalize_cluster_flow`] | `loadbalancer_id` |
//! | [`delete_cluster_flow`] | `loadbalancer_id` |

mod amphora;
mod cluster;

pub use amphora::{
    cert_rotate_amphora_flow, create_amphora_flow, delete_amphora_flow, failover_amphora_flow,
    get_amphora_for_lb_subflow, spare_fill_flow,
};
pub use cluster::{
    create_cluster_amphorae_flow, create_cluster_flow, delete_cluster_flow, finalize_cluster_flow,
};
