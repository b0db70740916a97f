use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    future::Future,
    marker::PhantomData,
    panic::Location,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;
use regex::Regex;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::http::header::HeaderName;
use actix_web::{Error, Result};

use crate::field::{DEFAULT_REQUEST_ID_HEADER, Field, resolve_referer, resolve_request_id};
use crate::request::RequestInfo;
use crate::wrapper::rust_log::{self, Sink};

/// Message of access records when no custom one is configured.
pub const DEFAULT_LOGGER_MESSAGE: &str = "Request handled";

/// Decides, once the wrapped service finished, that a request must not be logged.
pub type SkipRequest = Arc<dyn Fn(&Outcome<'_>) -> bool + Send + Sync>;

/// Produces extra fields appended after the standard ones.
pub type AdditionalFields = Arc<dyn Fn(&Outcome<'_>) -> Vec<Field> + Send + Sync>;

/// Middleware emitting one structured record per request.
///
/// Records go through the `log` crate with key/values. The level follows the response status:
/// `error` for 5xx, `warn` for 4xx and `info` otherwise.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_kvlog::{Logger, LoggerConfig};
///
/// let app = App::new()
///     .wrap(Logger::new(LoggerConfig::new().error_only().omit_user_agent()));
/// ```
pub struct Logger(Rc<Inner>);

#[derive(Debug, Clone)]
struct Inner {
    config: LoggerConfig,
    sink: Sink,
}

impl Logger {
    /// Create `Logger` middleware writing to the global `log` logger.
    pub fn new(config: LoggerConfig) -> Logger {
        Logger(Rc::new(Inner {
            config,
            sink: Sink::Global,
        }))
    }

    /// Write records to `sink` instead of the global logger.
    pub fn with_sink(mut self, sink: Arc<dyn log::Log>) -> Self {
        Rc::make_mut(&mut self.0).sink = Sink::Custom(sink);
        self
    }
}

impl Default for Logger {
    /// Create `Logger` middleware with every field enabled.
    ///
    /// Fields:
    /// - proto
    /// - host
    /// - method
    /// - status
    /// - response_size
    /// - latency
    /// - status_text
    /// - client_ip
    /// - user_agent
    /// - path
    /// - request_id (when known)
    /// - referer (when known)
    fn default() -> Self {
        Logger::new(LoggerConfig::default())
    }
}

/// Settings of the [`Logger`] middleware.
#[derive(Clone)]
pub struct LoggerConfig {
    error_only: bool,
    skip_request: Option<SkipRequest>,
    exclude: HashSet<String>,
    exclude_regex: Vec<Regex>,
    custom_message: Option<Cow<'static, str>>,
    include_caller: bool,
    omit_status_text: bool,
    omit_client_ip: bool,
    omit_user_agent: bool,
    omit_path: bool,
    omit_request_id: bool,
    omit_referer: bool,
    request_id_header: HeaderName,
    additional_fields: Option<AdditionalFields>,
    log_target: Cow<'static, str>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            error_only: false,
            skip_request: None,
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
            custom_message: None,
            include_caller: false,
            omit_status_text: false,
            omit_client_ip: false,
            omit_user_agent: false,
            omit_path: false,
            omit_request_id: false,
            omit_referer: false,
            request_id_header: HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER),
            additional_fields: None,
            log_target: Cow::Borrowed(module_path!()),
        }
    }
}

impl fmt::Debug for LoggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerConfig")
            .field("error_only", &self.error_only)
            .field("skip_request", &self.skip_request.is_some())
            .field("exclude", &self.exclude)
            .field("exclude_regex", &self.exclude_regex)
            .field("custom_message", &self.custom_message)
            .field("include_caller", &self.include_caller)
            .field("omit_status_text", &self.omit_status_text)
            .field("omit_client_ip", &self.omit_client_ip)
            .field("omit_user_agent", &self.omit_user_agent)
            .field("omit_path", &self.omit_path)
            .field("omit_request_id", &self.omit_request_id)
            .field("omit_referer", &self.omit_referer)
            .field("request_id_header", &self.request_id_header)
            .field("additional_fields", &self.additional_fields.is_some())
            .field("log_target", &self.log_target)
            .finish()
    }
}

impl LoggerConfig {
    pub fn new() -> Self {
        LoggerConfig::default()
    }

    /// Only log requests answered with a 3xx, 4xx or 5xx status or whose handler failed.
    pub fn error_only(mut self) -> Self {
        self.error_only = true;
        self
    }

    /// Skip the record when `skip` returns `true`.
    ///
    /// The predicate runs after the wrapped service, so it can look at the response.
    pub fn skip_request<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Outcome<'_>) -> bool + Send + Sync + 'static,
    {
        self.skip_request = Some(Arc::new(skip));
        self
    }

    /// Ignore and do not log access info for specified path.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        self.exclude.insert(path.into());
        self
    }

    /// Ignore and do not log access info for paths that match regex.
    pub fn exclude_regex<T: AsRef<str>>(mut self, pattern: T) -> Result<Self, regex::Error> {
        self.exclude_regex.push(Regex::new(pattern.as_ref())?);
        Ok(self)
    }

    /// Replace the default record message.
    pub fn custom_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    /// Attach file, line and module of the log statement. Omitted by default since it always
    /// points inside this crate.
    pub fn include_caller(mut self) -> Self {
        self.include_caller = true;
        self
    }

    pub fn omit_status_text(mut self) -> Self {
        self.omit_status_text = true;
        self
    }

    pub fn omit_client_ip(mut self) -> Self {
        self.omit_client_ip = true;
        self
    }

    pub fn omit_user_agent(mut self) -> Self {
        self.omit_user_agent = true;
        self
    }

    pub fn omit_path(mut self) -> Self {
        self.omit_path = true;
        self
    }

    pub fn omit_request_id(mut self) -> Self {
        self.omit_request_id = true;
        self
    }

    pub fn omit_referer(mut self) -> Self {
        self.omit_referer = true;
        self
    }

    /// Header carrying the request id. Defaults to `x-request-id`.
    pub fn request_id_header(mut self, header: HeaderName) -> Self {
        self.request_id_header = header;
        self
    }

    /// Append fields computed from the finished request.
    pub fn additional_fields<F>(mut self, fields: F) -> Self
    where
        F: Fn(&Outcome<'_>) -> Vec<Field> + Send + Sync + 'static,
    {
        self.additional_fields = Some(Arc::new(fields));
        self
    }

    /// Sets the logging target to `target`.
    ///
    /// By default, the log target is `actix_web_middleware_kvlog::logger`.
    ///
    /// # Examples
    /// Using `.log_target("http_log")` would have this effect on request logs:
    /// ```diff
    /// - {"level":"INFO","target":"actix_web_middleware_kvlog::logger","message":"Request handled",...}
    /// + {"level":"INFO","target":"http_log","message":"Request handled",...}
    ///                             ^^^^^^^^
    /// ```
    pub fn log_target(mut self, target: impl Into<Cow<'static, str>>) -> Self {
        self.log_target = target.into();
        self
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.contains(path) || self.exclude_regex.iter().any(|r| r.is_match(path))
    }

    fn message(&self) -> &str {
        match &self.custom_message {
            Some(message) if !message.is_empty() => message,
            _ => DEFAULT_LOGGER_MESSAGE,
        }
    }
}

/// What the wrapped service produced, as handed to [`SkipRequest`] and [`AdditionalFields`].
pub struct Outcome<'a> {
    info: &'a RequestInfo,
    result: Result<&'a ServiceResponse, &'a Error>,
}

impl<'a> Outcome<'a> {
    fn new(info: &'a RequestInfo, result: Result<&'a ServiceResponse, &'a Error>) -> Self {
        Outcome { info, result }
    }

    pub fn request_info(&self) -> &'a RequestInfo {
        self.info
    }

    /// The response, unless the wrapped service returned an error instead.
    pub fn response(&self) -> Option<&'a ServiceResponse> {
        self.result.ok()
    }

    pub fn status(&self) -> StatusCode {
        match self.result {
            Ok(res) => res.status(),
            Err(err) => err.as_response_error().status_code(),
        }
    }

    /// Error returned by the handler, whether actix already rendered it or not.
    pub fn error(&self) -> Option<&'a Error> {
        match self.result {
            Ok(res) => res.response().error(),
            Err(err) => Some(err),
        }
    }

    /// Matched route parameter. Example: `name` for `/greet/{name}`
    pub fn match_info(&self, name: &str) -> Option<&'a str> {
        self.response()?.request().match_info().get(name)
    }
}

impl<S, B> Transform<S, ServiceRequest> for Logger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = LoggerMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(LoggerMiddlewareService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Record waiting for the response body to be streamed.
#[derive(Debug)]
struct PendingRecord {
    level: log::Level,
    fields: Vec<Field>,
    size_slot: usize,
}

pin_project! {
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        record: Option<PendingRecord>,
        size: u64,
        inner: Rc<Inner>,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(record) = this.record.take() {
                this.inner.emit(record, *this.size);
            }
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.size += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

/// Logger middleware service.
pub struct LoggerMiddlewareService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for LoggerMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = LoggerResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let info = if self.inner.config.is_excluded(req.path()) {
            None
        } else {
            Some(RequestInfo::capture(&req))
        };

        LoggerResponse {
            start: Instant::now(),
            info,
            inner: Rc::clone(&self.inner),
            fut: self.service.call(req),
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct LoggerResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        start: Instant,
        info: Option<RequestInfo>,
        inner: Rc<Inner>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for LoggerResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<StreamLog<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let result = ready!(this.fut.poll(cx));
        let latency = this.start.elapsed();
        let inner = Rc::clone(this.inner);

        let Some(info) = this.info.take() else {
            return Poll::Ready(result.map(|res| {
                res.map_body(move |_, body| StreamLog {
                    body,
                    record: None,
                    size: 0,
                    inner,
                })
            }));
        };

        let res = match result {
            Ok(res) => res,
            Err(err) => {
                // actix renders the error itself, the record is complete right away
                if let Some(record) = inner.prepare(&Outcome::new(&info, Err(&err)), latency) {
                    let size = match err.error_response().body().size() {
                        BodySize::Sized(size) => size,
                        _ => 0,
                    };
                    inner.emit(record, size);
                }
                return Poll::Ready(Err(err));
            }
        };

        if let Some(error) = res.response().error() {
            log::debug!("Error in response: {:?}", error);
        }

        // to avoid polluting all the Logger types with the body parameter we swap the body
        // out temporarily since it's not usable in custom response functions anyway
        let (req, res) = res.into_parts();
        let (res, body) = res.into_parts();

        let temp_res = ServiceResponse::new(req, res.map_into_boxed_body());
        let record = inner.prepare(&Outcome::new(&info, Ok(&temp_res)), latency);

        // re-construct original service response
        let (req, res) = temp_res.into_parts();
        let res = ServiceResponse::new(req, res.set_body(body));

        Poll::Ready(Ok(res.map_body(move |_, body| StreamLog {
            body,
            record,
            size: 0,
            inner,
        })))
    }
}

/// Level of an access record for `status`.
pub(crate) fn level_for(status: StatusCode) -> log::Level {
    match status.as_u16() {
        500.. => log::Level::Error,
        400..=499 => log::Level::Warn,
        _ => log::Level::Info,
    }
}

impl Inner {
    fn prepare(&self, outcome: &Outcome<'_>, latency: Duration) -> Option<PendingRecord> {
        let config = &self.config;

        if config.skip_request.as_ref().is_some_and(|skip| skip(outcome)) {
            return None;
        }

        let status = outcome.status();
        if config.error_only && status.as_u16() < 300 && outcome.error().is_none() {
            return None;
        }

        let info = outcome.request_info();
        let response_headers = outcome.response().map(|res| res.headers());

        let mut fields = Vec::with_capacity(15);
        fields.push(Field::new("proto", info.protocol()));
        fields.push(Field::new("host", info.host()));
        fields.push(Field::new("method", info.method().as_str()));
        fields.push(Field::new("status", status.as_u16()));
        let size_slot = fields.len();
        fields.push(Field::new("response_size", 0u64));
        fields.push(Field::new("latency", latency));

        if !config.omit_status_text {
            fields.push(Field::new(
                "status_text",
                status.canonical_reason().unwrap_or_default(),
            ));
        }

        if !config.omit_client_ip {
            fields.push(Field::new("client_ip", info.client_ip()));
        }

        if !config.omit_user_agent {
            let user_agent = info.header("user-agent").unwrap_or_default();
            fields.push(Field::new("user_agent", user_agent));
        }

        if !config.omit_path {
            fields.push(Field::new("path", info.path()));
        }

        if !config.omit_request_id {
            if let Some(id) =
                resolve_request_id(&config.request_id_header, info.headers(), response_headers)
            {
                fields.push(Field::new("request_id", id));
            }
        }

        if !config.omit_referer {
            if let Some(referer) = resolve_referer(info.headers(), response_headers) {
                fields.push(Field::new("referer", referer));
            }
        }

        if let Some(additional) = &config.additional_fields {
            fields.extend(additional(outcome));
        }

        Some(PendingRecord {
            level: level_for(status),
            fields,
            size_slot,
        })
    }

    fn emit(&self, record: PendingRecord, size: u64) {
        let PendingRecord {
            level,
            mut fields,
            size_slot,
        } = record;

        if let Some(slot) = fields.get_mut(size_slot) {
            *slot = Field::new("response_size", size);
        }

        let loc = if self.config.include_caller {
            Some(Location::caller())
        } else {
            None
        };

        rust_log::log(
            self.sink.get(),
            level,
            self.config.log_target.as_ref(),
            module_path!(),
            loc,
            self.config.message(),
            &fields,
        );
    }
}
