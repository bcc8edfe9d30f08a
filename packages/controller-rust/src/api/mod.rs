//! Clients for the API service that owns the managed objects.

pub mod http;

pub use http::HttpApiClient;
