// The feature fixtures are single `json!` literals with over 40 keys
#![cfg_attr(test, recursion_limit = "256")]

pub mod feature;
pub mod metrics;
pub mod sink;
