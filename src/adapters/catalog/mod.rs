//! Catalog adapters: the HTTP client and the in-memory fake.

pub mod fake;
pub mod http;
pub mod retry;

pub use fake::FakeCatalog;
pub use http::HttpCatalog;
