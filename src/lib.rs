//! Dashgate - an HTTP front door for an embedded dashboard
//!
//! This library provides a small gateway that:
//! - Serves a fixed dashboard HTML page at `/`
//! - Exposes a static asset directory under `/static`
//! - Answers a health check at `/api/health`
//! - Reverse-proxies everything under `/streamlit` to a separately-run
//!   backend application, including transparent WebSocket upgrades
//! - Adds permissive CORS headers to every response

pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod router;
pub mod static_files;
