//! LingoTest Contract Validator
//!
//! Compiles an OpenAPI-style contract document into per-endpoint
//! request/response/parameter validators, validates live exchanges,
//! and exposes a validating HTTP client for interception.

pub mod client;
pub mod document;
pub mod schema;
pub mod validator;

pub use client::{ContractCheck, ValidatedResponse, ValidatingClient};
pub use document::ContractDocument;
pub use schema::{CompiledSchema, ValidationError, ValidationMode};
pub use validator::{ContractValidator, EndpointContract};
