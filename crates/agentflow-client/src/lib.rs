//! HTTP binding of [`agentflow_core::WorkflowApi`] for the workflow backend.

pub mod http;

pub use http::HttpWorkflowApi;
