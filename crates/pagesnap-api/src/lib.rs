//! # pagesnap-api
//!
//! HTTP front door for pagesnap: job submission, status reads and job
//! counts, served with axum.

pub mod gateway;
pub mod routes;

pub use gateway::{validate_source_uri, GatewayConfig, SubmissionGateway};
pub use routes::{router, ApiError, AppState, CreateJobRequest, CreateJobResponse};
