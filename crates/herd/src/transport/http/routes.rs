//! Record API routes.
//!
//! Handlers only translate HTTP into [`Intent`]s and [`Reply`]s back into
//! HTTP; the store lives behind a [`Backend`].

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
    routing::any,
};

use crate::bridge::protocol::{Intent, Reply};
use crate::worker::Backend;

/// Requests answered by the worker itself, without reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Invalid HTTP method")]
    UnsupportedMethod,
    #[error("Request to non-existing endpoint")]
    UnknownRoute,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedMethod => StatusCode::BAD_REQUEST,
            Self::UnknownRoute => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(CONTENT_TYPE, "text/plain")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Turn a reply into the HTTP response sent to the client.
///
/// Success bodies are JSON (empty for 204); failures are plain-text messages.
pub fn render(reply: Reply) -> Response {
    match reply {
        Reply::Success { status, data } => {
            let status = status_code(status);
            if status == StatusCode::NO_CONTENT || data.is_null() {
                (status, [(CONTENT_TYPE, "application/json")]).into_response()
            } else {
                (status, Json(data)).into_response()
            }
        }
        Reply::Failure { status, message } => (
            status_code(status),
            [(CONTENT_TYPE, "text/plain")],
            message,
        )
            .into_response(),
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn body_text(body: &Bytes) -> String {
    String::from_utf8_lossy(body).into_owned()
}

fn collection_intent(method: &Method, body: &Bytes) -> Result<Intent, Rejection> {
    match *method {
        Method::GET => Ok(Intent::read_all()),
        Method::POST => Ok(Intent::create(body_text(body))),
        Method::PUT | Method::DELETE => Err(Rejection::UnknownRoute),
        _ => Err(Rejection::UnsupportedMethod),
    }
}

fn member_intent(method: &Method, id: String, body: &Bytes) -> Result<Intent, Rejection> {
    match *method {
        Method::GET => Ok(Intent::read_one(id)),
        Method::PUT => Ok(Intent::update(id, body_text(body))),
        Method::DELETE => Ok(Intent::delete(id)),
        Method::POST => Err(Rejection::UnknownRoute),
        _ => Err(Rejection::UnsupportedMethod),
    }
}

/// Record routes match the bare path only; any query string is unknown.
fn without_query(uri: &Uri) -> Result<(), Rejection> {
    match uri.query() {
        Some(_) => Err(Rejection::UnknownRoute),
        None => Ok(()),
    }
}

async fn dispatch(backend: &dyn Backend, intent: Result<Intent, Rejection>) -> Response {
    match intent {
        Ok(intent) => render(backend.dispatch(intent).await),
        Err(rejection) => {
            tracing::debug!(%rejection, "Rejected request");
            rejection.into_response()
        }
    }
}

async fn collection(
    State(backend): State<Arc<dyn Backend>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let intent = without_query(&uri).and_then(|()| collection_intent(&method, &body));
    dispatch(backend.as_ref(), intent).await
}

async fn member(
    State(backend): State<Arc<dyn Backend>>,
    method: Method,
    uri: Uri,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let intent = without_query(&uri).and_then(|()| member_intent(&method, id, &body));
    dispatch(backend.as_ref(), intent).await
}

async fn unknown_route() -> Rejection {
    Rejection::UnknownRoute
}

pub fn routes(backend: Arc<dyn Backend>) -> Router {
    Router::new()
        .route("/api/users", any(collection))
        .route("/api/users/", any(collection))
        .route("/api/users/{id}", any(member))
        .fallback(unknown_route)
        .with_state(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PayloadSchema;
    use crate::worker::LocalBackend;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Records intents and answers with a fixed reply.
    struct Recorder {
        seen: Mutex<Vec<Intent>>,
        reply: Reply,
    }

    impl Recorder {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                reply,
            })
        }

        fn seen(&self) -> Vec<Intent> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for Recorder {
        async fn dispatch(&self, intent: Intent) -> Reply {
            self.seen.lock().unwrap().push(intent);
            self.reply.clone()
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn content_type(response: &Response) -> &str {
        response.headers()[CONTENT_TYPE].to_str().unwrap()
    }

    #[tokio::test]
    async fn requests_map_to_intents() {
        let recorder = Recorder::new(Reply::success(200, json!({})));
        let app = routes(recorder.clone());

        let cases = [
            ("GET", "/api/users", ""),
            ("GET", "/api/users/", ""),
            ("POST", "/api/users", r#"{"name":"a"}"#),
            ("GET", "/api/users/abc", ""),
            ("PUT", "/api/users/abc", r#"{"name":"b"}"#),
            ("DELETE", "/api/users/abc", ""),
        ];
        for (method, uri, body) in cases {
            let response = app
                .clone()
                .oneshot(request(method, uri, body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{method} {uri}");
        }

        assert_eq!(
            recorder.seen(),
            vec![
                Intent::read_all(),
                Intent::read_all(),
                Intent::create(r#"{"name":"a"}"#),
                Intent::read_one("abc"),
                Intent::update("abc", r#"{"name":"b"}"#),
                Intent::delete("abc"),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_routes_never_reach_backend() {
        let recorder = Recorder::new(Reply::success(200, json!({})));
        let app = routes(recorder.clone());

        for (method, uri) in [
            ("GET", "/api/unknown"),
            ("GET", "/"),
            ("GET", "/api/users/a/b"),
            ("POST", "/api/users/abc"),
            ("PUT", "/api/users"),
            ("DELETE", "/api/users"),
            ("GET", "/api/users?x=1"),
            ("GET", "/api/users/abc?x=1"),
        ] {
            let response = app.clone().oneshot(request(method, uri, "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
            assert_eq!(content_type(&response), "text/plain");
            assert_eq!(
                response_text(response).await,
                "Request to non-existing endpoint"
            );
        }
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn unsupported_methods_are_rejected() {
        let recorder = Recorder::new(Reply::success(200, json!({})));
        let app = routes(recorder.clone());

        for (method, uri) in [("PATCH", "/api/users"), ("PATCH", "/api/users/abc")] {
            let response = app.clone().oneshot(request(method, uri, "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(response_text(response).await, "Invalid HTTP method");
        }
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn failure_replies_render_as_text() {
        let app = routes(Recorder::new(Reply::failure(404, "Record not found")));

        let response = app
            .oneshot(request("GET", "/api/users/abc", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(content_type(&response), "text/plain");
        assert_eq!(response_text(response).await, "Record not found");
    }

    #[tokio::test]
    async fn no_content_has_empty_body() {
        let app = routes(Recorder::new(Reply::success(204, serde_json::Value::Null)));

        let response = app
            .oneshot(request("DELETE", "/api/users/abc", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(content_type(&response), "application/json");
        assert!(response_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn local_backend_end_to_end() {
        let app = routes(Arc::new(LocalBackend::new(PayloadSchema::Object)));

        let created = app
            .clone()
            .oneshot(request("POST", "/api/users", r#"{"name":"a"}"#))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(content_type(&created), "application/json");
        let created = response_json(created).await;
        let id = created["id"].as_str().unwrap().to_string();

        let all = app
            .clone()
            .oneshot(request("GET", "/api/users", ""))
            .await
            .unwrap();
        assert_eq!(response_json(all).await, json!([created]));

        let bad = app
            .clone()
            .oneshot(request("GET", "/api/users/123", ""))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_text(bad).await, "Invalid UUID format");

        let deleted = app
            .clone()
            .oneshot(request("DELETE", &format!("/api/users/{id}"), ""))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = app
            .oneshot(request("GET", &format!("/api/users/{id}"), ""))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(response_text(missing).await, "Record not found");
    }
}
