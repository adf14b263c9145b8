//! HTTP-facing surfaces: the worker record API and the primary's balancer.

pub mod balancer;
pub mod http;
