//! Actix-web middlewares for structured request logging and panic recovery.
//!
//! [`Logger`] writes one record per request with key/values through the standard `log` crate.
//! [`Recover`] catches panics raised by handlers, logs them and answers with
//! `500 Internal Server Error` instead of tearing the connection down.
//!
//! # Examples:
//! ## Records go to whatever logger is installed for the `log` crate.
//! ```bash
//! cargo add actix-web-middleware-kvlog
//! ```
//! Example usage with `structured_logger` crate:
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_kvlog::{Logger, Recover};
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     HttpServer::new(|| {
//!         App::new()
//!             .wrap(Recover::default())
//!             .wrap(Logger::default())
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//! `Recover` has to be registered before `Logger`: the middleware registered last runs first,
//! so the logger sees the 500 produced for a panic.
//!
//! # Logged fields
//!
//! Every access record carries, in this order:
//!
//! - `proto` - HTTP protocol version, e.g. `HTTP/1.1`
//! - `host` - Request host
//! - `method` - HTTP method
//! - `status` - Response status code
//! - `response_size` - Body bytes written to the client
//! - `latency` - Time spent in the wrapped service
//! - `status_text` - Canonical reason of the status
//! - `client_ip` - Client address, proxy headers honoured
//! - `user_agent` - Client user agent, empty when absent
//! - `path` - Request target, query string included
//! - `request_id` - Value of the request id header, when present
//! - `referer` - Referer, when present
//!
//! The last six can be switched off with the `omit_*` options of [`LoggerConfig`].
//! Fields returned by [`LoggerConfig::additional_fields`] come after them.
//!
//! # Configuration
//!
//! ```rust
//! use actix_web::http::header::HeaderName;
//! use actix_web_middleware_kvlog::{Field, Logger, LoggerConfig, Recover, RecoverConfig};
//!
//! let logger = Logger::new(
//!     LoggerConfig::new()
//!         .custom_message("Served")
//!         .omit_referer()
//!         .request_id_header(HeaderName::from_static("my-request-id"))
//!         .skip_request(|outcome| outcome.match_info("name") == Some("nolog"))
//!         .additional_fields(|outcome| {
//!             vec![Field::new("name", outcome.match_info("name").unwrap_or_default().to_string())]
//!         })
//!         .exclude("/health"),
//! );
//!
//! let recover = Recover::new(
//!     RecoverConfig::new()
//!         .stack_trace()
//!         .stack_trace_size(8 << 10)
//!         .error_handler(|info, err| eprintln!("{} {} panicked: {err}", info.method(), info.path())),
//! );
//! ```
//!
//! ## Path Exclusions
//!
//! Excluded paths skip the logger entirely, before the wrapped service runs:
//!
//! ```rust
//! use actix_web_middleware_kvlog::LoggerConfig;
//!
//! let config = LoggerConfig::default()
//!     .exclude("/health")
//!     .exclude_regex(r"^/assets/.*")
//!     .unwrap();
//! ```

mod field;
mod logger;
mod recover;
mod request;
#[cfg(test)]
mod test_util;
mod wrapper;

pub use crate::field::{DEFAULT_REQUEST_ID_HEADER, Field, FieldValue};
pub use crate::logger::{
    AdditionalFields, DEFAULT_LOGGER_MESSAGE, Logger, LoggerConfig, LoggerMiddlewareService,
    Outcome, SkipRequest,
};
pub use crate::recover::{
    DEFAULT_RECOVER_MESSAGE, DEFAULT_STACK_TRACE_SIZE, ErrorHandler, PanicError, Recover,
    RecoverConfig, RecoverFields, RecoverMiddlewareService,
};
pub use crate::request::RequestInfo;
