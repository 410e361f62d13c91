//! A tiny in-process channel server for tests: serves a directory over http
//! with `ETag`/`If-None-Match` handling, like a real repodata host.

use std::path::PathBuf;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use krait_digest::{compute_bytes_digest, Md5};
use url::Url;

#[derive(Clone)]
struct ServerState {
    root: PathBuf,
    max_age: Option<u64>,
}

pub struct SimpleChannelServer {
    url: Url,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

impl SimpleChannelServer {
    /// Serves `root` without cache-control headers, so clients must
    /// revalidate with conditional requests.
    pub async fn start(root: PathBuf) -> Self {
        Self::start_inner(root, None).await
    }

    /// Serves `root` with a `Cache-Control: public, max-age=<secs>` header.
    pub async fn start_with_max_age(root: PathBuf, secs: u64) -> Self {
        Self::start_inner(root, Some(secs)).await
    }

    async fn start_inner(root: PathBuf, max_age: Option<u64>) -> Self {
        let state = ServerState { root, max_age };
        let app = Router::new().fallback(serve_file).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding an ephemeral port succeeds");
        let address = listener.local_addr().expect("listener has an address");
        let (shutdown, receiver) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = receiver.await;
                })
                .await
                .expect("server runs until shutdown");
        });

        Self {
            url: Url::parse(&format!("http://{address}/")).expect("socket address is a valid url"),
            _shutdown: shutdown,
        }
    }

    /// The base url of the server.
    pub fn url(&self) -> Url {
        self.url.clone()
    }
}

async fn serve_file(State(state): State<ServerState>, request: Request<Body>) -> Response<Body> {
    let relative = request.uri().path().trim_start_matches('/');
    let path = state.root.join(relative);

    let Ok(content) = std::fs::read(&path) else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("static response builds");
    };

    let etag = format!("\"{:x}\"", compute_bytes_digest::<Md5>(&content));
    let if_none_match = request
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());

    let mut builder = Response::builder().header(header::ETAG, &etag);
    if let Some(max_age) = state.max_age {
        builder = builder.header(header::CACHE_CONTROL, format!("public, max-age={max_age}"));
    }

    if if_none_match == Some(etag.as_str()) {
        builder
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .expect("static response builds")
    } else {
        builder
            .status(StatusCode::OK)
            .body(Body::from(content))
            .expect("static response builds")
    }
}
