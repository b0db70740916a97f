use std::{
    any::Any,
    backtrace::Backtrace,
    borrow::Cow,
    cell::{Cell, RefCell},
    error::Error as StdError,
    fmt, io,
    future::Future,
    panic::{self, AssertUnwindSafe, Location},
    pin::Pin,
    rc::Rc,
    sync::{Arc, Once},
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use actix_service::{Service, Transform};
use actix_utils::future::{Either, Ready, ready};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::http::header::HeaderName;
use actix_web::{Error, HttpResponse, ResponseError, Result};

use crate::field::{DEFAULT_REQUEST_ID_HEADER, Field, resolve_request_id};
use crate::request::RequestInfo;
use crate::wrapper::rust_log::{self, Sink};

/// Message of panic records when no custom one is configured.
pub const DEFAULT_RECOVER_MESSAGE: &str = "Recovered from panic";

/// Default upper bound, in bytes, of the captured stack trace.
pub const DEFAULT_STACK_TRACE_SIZE: usize = 4 << 10;

/// Called after a panic has been logged.
pub type ErrorHandler = Arc<dyn Fn(&RequestInfo, &PanicError) + Send + Sync>;

/// Produces extra fields for the panic record.
pub type RecoverFields = Arc<dyn Fn(&RequestInfo, &PanicError) -> Vec<Field> + Send + Sync>;

/// A panic caught by [`Recover`], turned into an error.
///
/// Answers with a bare `500 Internal Server Error`; the panic message never reaches the client.
#[derive(Debug, thiserror::Error)]
pub enum PanicError {
    /// The handler panicked with a message, e.g. `panic!("boom")`.
    #[error("{0}")]
    Message(String),
    /// The handler panicked with an error through `std::panic::panic_any`.
    #[error("{0}")]
    Error(Box<dyn StdError + Send + Sync>),
    #[error("panicked with a non-string payload")]
    Opaque,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<&'static str>() {
            Ok(message) => return PanicError::Message((*message).to_string()),
            Err(payload) => payload,
        };

        let payload = match payload.downcast::<String>() {
            Ok(message) => return PanicError::Message(*message),
            Err(payload) => payload,
        };

        let payload = match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
            Ok(err) => return PanicError::Error(*err),
            Err(payload) => payload,
        };

        let payload = match payload.downcast::<io::Error>() {
            Ok(err) => return PanicError::Error(err),
            Err(payload) => payload,
        };

        // not `Sync`, only the message can be kept
        match payload.downcast::<Box<dyn StdError + Send>>() {
            Ok(err) => PanicError::Message(err.to_string()),
            Err(_) => PanicError::Opaque,
        }
    }
}

impl ResponseError for PanicError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().body("Internal Server Error")
    }
}

/// Middleware that stops panics of the wrapped service, logs them and answers with a 500.
///
/// Register it before [`Logger`](crate::Logger) so the access record sees the 500.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_kvlog::{Logger, Recover, RecoverConfig};
///
/// let app = App::new()
///     .wrap(Recover::new(RecoverConfig::new().stack_trace()))
///     .wrap(Logger::default());
/// ```
pub struct Recover(Rc<Inner>);

#[derive(Debug, Clone)]
struct Inner {
    config: RecoverConfig,
    sink: Sink,
}

impl Recover {
    /// Create `Recover` middleware writing to the global `log` logger.
    pub fn new(config: RecoverConfig) -> Recover {
        if config.stack_trace {
            install_trace_hook();
        }

        Recover(Rc::new(Inner {
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

impl Default for Recover {
    fn default() -> Self {
        Recover::new(RecoverConfig::default())
    }
}

/// Settings of the [`Recover`] middleware.
#[derive(Clone)]
pub struct RecoverConfig {
    custom_message: Option<Cow<'static, str>>,
    stack_trace: bool,
    stack_trace_size: usize,
    request_id_header: HeaderName,
    error_handler: Option<ErrorHandler>,
    additional_fields: Option<RecoverFields>,
    include_caller: bool,
    log_target: Cow<'static, str>,
}

impl Default for RecoverConfig {
    fn default() -> Self {
        RecoverConfig {
            custom_message: None,
            stack_trace: false,
            stack_trace_size: DEFAULT_STACK_TRACE_SIZE,
            request_id_header: HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER),
            error_handler: None,
            additional_fields: None,
            include_caller: false,
            log_target: Cow::Borrowed(module_path!()),
        }
    }
}

impl fmt::Debug for RecoverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverConfig")
            .field("custom_message", &self.custom_message)
            .field("stack_trace", &self.stack_trace)
            .field("stack_trace_size", &self.stack_trace_size)
            .field("request_id_header", &self.request_id_header)
            .field("error_handler", &self.error_handler.is_some())
            .field("additional_fields", &self.additional_fields.is_some())
            .field("include_caller", &self.include_caller)
            .field("log_target", &self.log_target)
            .finish()
    }
}

impl RecoverConfig {
    pub fn new() -> Self {
        RecoverConfig::default()
    }

    /// Replace the default record message.
    pub fn custom_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    /// Add a `stacktrace` field to the panic record.
    ///
    /// The trace is taken where the panic was raised, through a panic hook chained in front of the
    /// current one when the middleware is created. A hook installed later replaces it, in which
    /// case the trace starts at the middleware.
    pub fn stack_trace(mut self) -> Self {
        self.stack_trace = true;
        self
    }

    /// Maximum length of the `stacktrace` field in bytes. `0` restores the default of 4 KiB.
    pub fn stack_trace_size(mut self, size: usize) -> Self {
        self.stack_trace_size = if size == 0 {
            DEFAULT_STACK_TRACE_SIZE
        } else {
            size
        };
        self
    }

    /// Header carrying the request id. Defaults to `x-request-id`.
    pub fn request_id_header(mut self, header: HeaderName) -> Self {
        self.request_id_header = header;
        self
    }

    /// Run `handler` after the panic has been logged, e.g. to alert or count.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestInfo, &PanicError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Append fields computed from the request and the panic.
    pub fn additional_fields<F>(mut self, fields: F) -> Self
    where
        F: Fn(&RequestInfo, &PanicError) -> Vec<Field> + Send + Sync + 'static,
    {
        self.additional_fields = Some(Arc::new(fields));
        self
    }

    pub fn include_caller(mut self) -> Self {
        self.include_caller = true;
        self
    }

    /// Sets the logging target to `target`. Defaults to `actix_web_middleware_kvlog::recover`.
    pub fn log_target(mut self, target: impl Into<Cow<'static, str>>) -> Self {
        self.log_target = target.into();
        self
    }

    fn message(&self) -> &str {
        match &self.custom_message {
            Some(message) if !message.is_empty() => message,
            _ => DEFAULT_RECOVER_MESSAGE,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Recover
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RecoverMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RecoverMiddlewareService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Recover middleware service.
pub struct RecoverMiddlewareService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for RecoverMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Either<RecoverResponse<S::Future>, Ready<Result<Self::Response, Self::Error>>>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let info = RequestInfo::capture_header(&req, &self.inner.config.request_id_header);

        match self.inner.catch(|| self.service.call(req)) {
            Ok(fut) => Either::left(RecoverResponse {
                fut,
                info,
                inner: Rc::clone(&self.inner),
            }),
            Err(caught) => Either::right(ready(Err(self.inner.recover(&info, caught)))),
        }
    }
}

pin_project! {
    pub struct RecoverResponse<F> {
        #[pin]
        fut: F,
        info: RequestInfo,
        inner: Rc<Inner>,
    }
}

impl<F, R> Future for RecoverResponse<F>
where
    F: Future<Output = Result<R, Error>>,
{
    type Output = Result<R, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let fut = this.fut;

        match this.inner.catch(|| fut.poll(cx)) {
            Ok(poll) => poll,
            Err(caught) => Poll::Ready(Err(this.inner.recover(this.info, caught))),
        }
    }
}

thread_local! {
    /// Number of `Inner::catch` calls with stack traces on, running on this thread.
    static ARMED: Cell<usize> = const { Cell::new(0) };
    /// Backtrace of the last panic raised while armed.
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.try_with(Cell::get).unwrap_or(0) > 0 {
                let trace = Backtrace::force_capture();
                let _ = PANIC_TRACE.try_with(|slot| slot.replace(Some(trace)));
            }
            previous(info);
        }));
    });
}

/// A panic stopped by [`Recover`].
struct Caught {
    payload: Box<dyn Any + Send>,
    trace: Option<Backtrace>,
}

/// `trace` as text, cut to at most `limit` bytes.
fn render_stack_trace(trace: &Backtrace, limit: usize) -> String {
    let mut trace = trace.to_string();
    if trace.len() > limit {
        let mut end = limit;
        while !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    trace
}

impl Inner {
    /// Run `f`, stopping a panic it raises. The backtrace of the panic is kept when stack traces
    /// are on.
    fn catch<T>(&self, f: impl FnOnce() -> T) -> Result<T, Caught> {
        if !self.config.stack_trace {
            return panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| Caught { payload, trace: None });
        }

        ARMED.with(|armed| armed.set(armed.get() + 1));
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        ARMED.with(|armed| armed.set(armed.get() - 1));

        // also drops traces of panics `f` caught itself
        let trace = PANIC_TRACE.with(RefCell::take);
        result.map_err(|payload| Caught { payload, trace })
    }

    fn debug(&self, message: &str) {
        rust_log::log(
            self.sink.get(),
            log::Level::Debug,
            self.config.log_target.as_ref(),
            module_path!(),
            None,
            message,
            &[],
        );
    }

    /// Log the panic, run the callbacks and turn it into an error rendering a 500.
    fn recover(&self, info: &RequestInfo, caught: Caught) -> Error {
        let config = &self.config;
        let Caught { payload, trace } = caught;
        let err = PanicError::from_payload(payload);

        // a user `Display` may panic too
        let message = panic::catch_unwind(AssertUnwindSafe(|| err.to_string())).unwrap_or_default();

        let mut fields = Vec::with_capacity(8);
        fields.push(Field::new("error", message));
        fields.push(Field::new("method", info.method().as_str()));
        fields.push(Field::new("path", info.path()));
        fields.push(Field::new("client_ip", info.client_ip()));

        // there is no response after a panic, only the request can carry the id
        if let Some(id) = resolve_request_id(&config.request_id_header, info.headers(), None) {
            fields.push(Field::new("request_id", id));
        }

        if config.stack_trace {
            let trace = trace.unwrap_or_else(Backtrace::force_capture);
            fields.push(Field::new(
                "stacktrace",
                render_stack_trace(&trace, config.stack_trace_size),
            ));
        }

        if let Some(additional) = &config.additional_fields {
            match panic::catch_unwind(AssertUnwindSafe(|| additional(info, &err))) {
                Ok(extra) => fields.extend(extra),
                Err(_) => self.debug("Additional fields callback panicked during recovery"),
            }
        }

        let loc = if config.include_caller {
            Some(Location::caller())
        } else {
            None
        };

        rust_log::log(
            self.sink.get(),
            log::Level::Error,
            config.log_target.as_ref(),
            module_path!(),
            loc,
            config.message(),
            &fields,
        );

        if let Some(handler) = &config.error_handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(info, &err))).is_err() {
                self.debug("Error handler panicked during recovery");
            }
        }

        err.into()
    }
}
