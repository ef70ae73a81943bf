//! Infrastructure implementations for the Probeflow scenario engine.
//!
//! The engine core is IO-free; this crate supplies the live side of its
//! ports. Currently that is [`http::ReqwestDispatcher`], the production
//! `HttpDispatch` implementation over `reqwest::Client`.

pub mod http;

pub use http::ReqwestDispatcher;
