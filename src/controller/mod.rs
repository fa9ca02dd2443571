//! Kube-runtime glue for the pod controller
//!
//! Pods are watched with a `spec.nodeName` field selector so each instance
//! only sees the pods on its own node.

mod pod;

pub use pod::{error_policy, reconcile, Context, ContextBuilder};
