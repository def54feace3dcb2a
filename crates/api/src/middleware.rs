use axum::{extract::Request, http::Method, middleware::Next, response::Response};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

/// 运维接口记录info，对端RPC调用频繁，只记录debug
pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;
    let duration = start.elapsed();

    if uri.path().starts_with("/rpc/") {
        debug!(
            "RPC请求: {} {} - 状态: {} - 耗时: {:?}",
            method,
            uri,
            response.status(),
            duration
        );
    } else {
        info!(
            "完成请求处理: {} {} - 状态: {} - 耗时: {:?}",
            method,
            uri,
            response.status(),
            duration
        );
    }

    response
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
