//! Try:
//! ```bash
//! curl http://127.0.0.1:8000
//! curl http://127.0.0.1:8000/panic
//! ```

use actix_web::{App, HttpResponse, HttpServer, web};
use actix_web_middleware_kvlog::{Logger, Recover};
use structured_logger::{Builder, async_json::new_writer};

async fn index() -> HttpResponse {
    HttpResponse::Ok().body("Greetings!\n")
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
        App::new()
            .wrap(Recover::default())
            .wrap(Logger::default())
            .route("/", web::get().to(index))
            .route("/panic", web::get().to(panic))
    })
    .bind("127.0.0.1:8000")?
    .run()
    .await
}
