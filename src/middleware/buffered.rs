//! In-memory response buffer used by the timeout middleware.
//!
//! A guarded handler never writes to the connection directly. Its response is
//! collected here first (head and complete body), and
//! only the caller that wins the deadline race turns it into the real
//! response. A streaming body that stalls halfway therefore cannot leak a
//! partial response past the deadline.

use axum::body::{Body, Bytes};
use axum::http::{Extensions, HeaderMap, Response, StatusCode, Version};
use axum::response::IntoResponse;

/// A fully buffered response: status, version, headers, extensions and body.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
}

impl BufferedResponse {
    /// Drain `response` into memory.
    ///
    /// # Errors
    ///
    /// Returns the body error if the downstream body stream fails.
    pub async fn collect(response: Response<Body>) -> Result<Self, axum::Error> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;

        Ok(Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            extensions: parts.extensions,
            body,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl IntoResponse for BufferedResponse {
    /// Copy the buffered head and body verbatim.
    ///
    /// Headers are appended one value at a time so repeated headers
    /// (`set-cookie`, `vary`, ...) survive intact.
    fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.extensions_mut() = self.extensions;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    #[tokio::test]
    async fn test_collect_preserves_status_headers_and_body() {
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("x-custom", "one")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(Body::from("created"))
            .unwrap();

        let buffered = BufferedResponse::collect(response).await.unwrap();

        assert_eq!(buffered.status(), StatusCode::CREATED);
        assert_eq!(buffered.headers().get("x-custom").unwrap(), "one");
        assert_eq!(buffered.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(buffered.body().as_ref(), b"created");
    }

    #[tokio::test]
    async fn test_into_response_keeps_multi_value_headers() {
        let response = Response::builder()
            .header("vary", "accept")
            .header("vary", "origin")
            .body(Body::from("ok"))
            .unwrap();

        let replayed = BufferedResponse::collect(response)
            .await
            .unwrap()
            .into_response();

        let values: Vec<_> = replayed
            .headers()
            .get_all("vary")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["accept", "origin"]);

        let body = axum::body::to_bytes(replayed.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_extensions_and_version_survive_replay() {
        let mut response = Response::builder()
            .version(Version::HTTP_10)
            .body(Body::from("ok"))
            .unwrap();
        response.extensions_mut().insert(Marker(7));

        let buffered = BufferedResponse::collect(response).await.unwrap();
        assert_eq!(buffered.extensions().get::<Marker>(), Some(&Marker(7)));

        let replayed = buffered.into_response();
        assert_eq!(replayed.version(), Version::HTTP_10);
        assert_eq!(replayed.extensions().get::<Marker>(), Some(&Marker(7)));
    }
}
