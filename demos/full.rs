//! Try:
//! ```bash
//! curl http://127.0.0.1:8000
//! curl http://127.0.0.1:8000/greet/John
//! curl http://127.0.0.1:8000/nolog
//! curl http://127.0.0.1:8000/panic
//! curl -H 'My-Request-Id: 31337' http://127.0.0.1:8000
//! ```

use actix_web::http::header::HeaderName;
use actix_web::{App, HttpResponse, HttpServer, web};
use actix_web_middleware_kvlog::{Field, Logger, LoggerConfig, Recover, RecoverConfig};
use structured_logger::{Builder, async_json::new_writer};

const REQUEST_ID_HEADER: &str = "my-request-id";

async fn index() -> HttpResponse {
    HttpResponse::Ok().body("Hello!\n")
}

async fn greet(name: web::Path<String>) -> HttpResponse {
    HttpResponse::Ok().body(format!("Greetings {name}.\n"))
}

async fn nolog() -> HttpResponse {
    HttpResponse::Ok().body("This will not be logged.\n")
}

async fn panic() -> HttpResponse {
    panic!("intentional.")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    Builder::new()
        .with_target_writer("*", new_writer(tokio::io::stdout()))
        .init();

    HttpServer::new(|| {
        let logger_config = LoggerConfig::new()
            .skip_request(|outcome| outcome.request_info().path() == "/nolog")
            .custom_message("Request received!")
            .include_caller()
            .request_id_header(HeaderName::from_static(REQUEST_ID_HEADER))
            .additional_fields(|outcome| match outcome.match_info("name") {
                Some(name) => vec![Field::new("name", name)],
                None => Vec::new(),
            });

        let recover_config = RecoverConfig::new()
            .custom_message("Panic happened!")
            .stack_trace()
            .stack_trace_size(4 << 10)
            .request_id_header(HeaderName::from_static(REQUEST_ID_HEADER))
            .error_handler(|_, err| println!("Panic :( Error: {err}"));

        App::new()
            .wrap(Recover::new(recover_config))
            .wrap(Logger::new(logger_config))
            .route("/", web::get().to(index))
            .route("/greet/{name}", web::get().to(greet))
            .route("/nolog", web::get().to(nolog))
            .route("/panic", web::get().to(panic))
    })
    .bind("127.0.0.1:8000")?
    .run()
    .await
}
