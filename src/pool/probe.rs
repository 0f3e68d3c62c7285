//! Health probe execution over a dedicated connection.

use axum::body::Body;
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;

use crate::load_balancer::BackendTarget;
use crate::net::BoxedStream;

/// Send `GET path` over `stream` and report whether the backend answered 2xx.
pub(crate) async fn http_get(stream: BoxedStream, target: &BackendTarget, path: &str) -> Result<(), String> {
    let (mut sender, conn) = http1::handshake::<_, Body>(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake failed: {e}"))?;
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::trace!(error = %e, "Probe connection closed with error");
        }
    });

    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("host", target.authority())
        .header("user-agent", "stream-gateway-health-check")
        .header("connection", "close")
        .body(Body::empty())
        .map_err(|e| format!("invalid probe request: {e}"))?;

    let result = match sender.send_request(request).await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(format!("non-success status {}", response.status())),
        Err(e) => Err(format!("request failed: {e}")),
    };

    drop(sender);
    driver.abort();
    result
}
