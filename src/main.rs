use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod config;
mod extract;
mod models;

use config::Config;
use extract::Extractor;
use models::{ExtractRequest, ExtractionStatus, FailureKind, ProductRecord};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let extractor = Extractor::new(&config).context("failed to build HTTP client")?;
    let app = router(Arc::new(extractor));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(extractor: Arc<Extractor>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/extract", post(extract_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(extractor)
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "Welcome to the product extractor API"}))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn extract_endpoint(
    State(extractor): State<Arc<Extractor>>,
    Json(req): Json<ExtractRequest>,
) -> Response {
    // Bad URLs are a client error (400), not an upstream failure (502).
    if let Err(e) = extract::validate_url(&req.url) {
        tracing::warn!(url = %req.url, error = %e, "rejected extraction request");
        let record = ProductRecord::failed(&req.url, e.kind(), e.to_string());
        return (StatusCode::BAD_REQUEST, Json(record)).into_response();
    }

    let record = extractor.extract(&req.url).await;
    (status_code_for(&record), Json(record)).into_response()
}

/// The body always carries the record; the status code only summarizes it.
fn status_code_for(record: &ProductRecord) -> StatusCode {
    match (record.status, record.error.as_ref().map(|e| e.kind)) {
        (ExtractionStatus::Failed, Some(FailureKind::Parse)) => StatusCode::UNPROCESSABLE_ENTITY,
        (ExtractionStatus::Failed, _) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::Html};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(Extractor::without_proxy(&Config::default())))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn extract_request(url: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/extract")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "url": url }).to_string()))
            .unwrap()
    }

    async fn serve_page(page: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pages = Router::new().route("/p/item", get(move || async move { Html(page) }));
        tokio::spawn(async move {
            axum::serve(listener, pages).await.unwrap();
        });
        format!("http://{}/p/item", addr)
    }

    #[tokio::test]
    async fn root_and_health() {
        let (status, body) = send(
            app(),
            Request::builder().uri("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("product extractor"));

        let (status, body) = send(
            app(),
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn invalid_url_is_bad_request_with_failed_record() {
        let (status, body) = send(app(), extract_request("ftp://www.ikea.com/p/x")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"]["kind"], "fetch");
        assert_eq!(body["images"], json!([]));
        assert_eq!(body["materials"], "");
    }

    #[tokio::test]
    async fn unreachable_host_is_bad_gateway() {
        let (status, body) = send(app(), extract_request("https://unreachable.invalid/x")).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["measurements"], json!([]));
    }

    #[tokio::test]
    async fn partial_record_is_ok_without_error_field() {
        let url = serve_page(
            r#"<html><body>
                 <ul class="pip-product-dimensions__dimensions-container">
                   <li class="pip-product-dimensions__measurement-wrapper">80x40x75 cm</li>
                 </ul>
               </body></html>"#,
        )
        .await;

        let (status, body) = send(app(), extract_request(&url)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "partial");
        assert_eq!(body["source_url"], url.as_str());
        assert_eq!(body["measurements"], json!(["80x40x75 cm"]));
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn unrecognized_page_is_unprocessable() {
        let url = serve_page(
            r#"<html><head><meta property="og:image" content="/og.png"></head>
               <body><header><img src="/logo.svg"></header><h1>Page not found</h1></body></html>"#,
        )
        .await;

        let (status, body) = send(app(), extract_request(&url)).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "parse");
        assert_eq!(body["images"], json!([]));
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/extract")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"link": "https://www.ikea.com"}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
