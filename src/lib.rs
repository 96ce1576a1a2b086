// Copilot Gateway - Library root for testing

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;

#[cfg(test)]
pub(crate) mod test_support;
