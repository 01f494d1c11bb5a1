use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use imagecache::backend::{StorageBackend, WriteProps};
use imagecache::config::{BackendSettings, CacheSettings};
use imagecache::{router, AppState};
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot`

/// Helper to create a test app rooted in a temp dir
async fn test_app(configure: impl FnOnce(&mut CacheSettings)) -> (Router, AppState, TempDir) {
    let dir = TempDir::new().unwrap();
    let public = dir.path().join("public");
    std::fs::create_dir_all(public.join("images")).unwrap();
    std::fs::write(public.join("images/photo.jpg"), jpeg(400, 300)).unwrap();
    std::fs::write(public.join("robots.txt"), b"User-agent: *").unwrap();

    let mut settings = CacheSettings {
        backend: BackendSettings::Fs { root: dir.path().join("cache") },
        static_root: public,
        ..Default::default()
    };
    configure(&mut settings);

    let state = AppState::from_settings(settings).await.unwrap();
    (router(state.clone()), state, dir)
}

fn jpeg(w: u32, h: u32) -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(w, h);
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg).unwrap();
    out
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Bytes {
    axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _dir) = test_app(|_| {}).await;
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"], "fs");
}

#[tokio::test]
async fn test_miss_then_redirect_to_cached_artifact() {
    let (app, state, _dir) = test_app(|_| {}).await;

    let first = get(&app, "/images/photo.jpg?width=200").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert!(first.headers().contains_key("x-image-processed-by"));
    let rendered = body_bytes(first).await;
    let decoded = image::load_from_memory(&rendered).unwrap();
    assert_eq!(decoded.width(), 200);
    assert_eq!(decoded.height(), 150);

    let second = get(&app, "/images/photo.jpg?width=200").await;
    assert_eq!(second.status(), StatusCode::FOUND);
    let location = second.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("/blobs/_ic~static/ic~"), "{location}");

    let cached = get(&app, &location).await;
    assert_eq!(cached.status(), StatusCode::OK);
    assert_eq!(body_bytes(cached).await, rendered);

    let stats = state.cache.metrics().snapshot();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.transforms, 1);
}

#[tokio::test]
async fn test_streaming_mode_serves_bytes_and_304() {
    let (app, state, _dir) = test_app(|s| s.stream_cached_image = true).await;

    let rendered = body_bytes(get(&app, "/images/photo.jpg?width=100&format=png").await).await;

    let second = get(&app, "/images/photo.jpg?width=100&format=png").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()[header::CONTENT_TYPE], "image/png");
    let etag = second.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(body_bytes(second).await, rendered);

    let conditional = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/images/photo.jpg?width=100&format=png")
                .header(header::IF_NONE_MATCH, etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(state.cache.metrics().snapshot().transforms, 1);
}

#[tokio::test]
async fn test_miss_etag_revalidates() {
    let (app, state, _dir) = test_app(|s| s.stream_cached_image = true).await;

    let first = get(&app, "/images/photo.jpg?width=80").await;
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first.headers()[header::ETAG].to_str().unwrap().to_string();

    let conditional = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/images/photo.jpg?width=80")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(conditional.headers()[header::ETAG], etag.as_str());
    assert_eq!(state.cache.metrics().snapshot().transforms, 1);
}

#[tokio::test]
async fn test_blob_route_only_serves_artifacts() {
    let (app, state, _dir) = test_app(|_| {}).await;
    let backend = state.cache.backend();
    for locator in ["3f2a/.secret.jpg", "3f2a/photo.jpg", "3f2a/.ic~x.jpg.tmp-1-0"] {
        backend.write(locator, Bytes::from(jpeg(8, 8)), &WriteProps::default()).await.unwrap();
    }

    assert_eq!(get(&app, "/blobs/3f2a/.secret.jpg").await.status(), StatusCode::FORBIDDEN);
    assert_eq!(get(&app, "/blobs/3f2a/photo.jpg").await.status(), StatusCode::FORBIDDEN);
    assert_eq!(get(&app, "/blobs/3f2a/.ic~x.jpg.tmp-1-0").await.status(), StatusCode::FORBIDDEN);

    let resp = get(&app, "/media/3f2a/photo.jpg?width=4").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let location = get(&app, "/media/3f2a/photo.jpg?width=4").await.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("/blobs/3f2a/ic~"), "{location}");
    assert_eq!(get(&app, &location).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_signed_redirects() {
    let (app, _, _dir) = test_app(|s| s.signing_key = Some("test-secret-key".into())).await;

    get(&app, "/images/photo.jpg?width=120").await;
    let second = get(&app, "/images/photo.jpg?width=120").await;
    assert_eq!(second.status(), StatusCode::FOUND);
    let location = second.headers()[header::LOCATION].to_str().unwrap().to_string();
    assert!(location.contains("&se=") && location.contains("&sig="), "{location}");

    assert_eq!(get(&app, &location).await.status(), StatusCode::OK);

    let unsigned = location.split('?').next().unwrap().to_string();
    assert_eq!(get(&app, &unsigned).await.status(), StatusCode::UNAUTHORIZED);

    let tampered = format!("{}0", location);
    assert_eq!(get(&app, &tampered).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_static_passthrough() {
    let (app, _, dir) = test_app(|_| {}).await;

    let original = get(&app, "/images/photo.jpg").await;
    assert_eq!(original.status(), StatusCode::OK);
    assert_eq!(
        body_bytes(original).await,
        std::fs::read(dir.path().join("public/images/photo.jpg")).unwrap()
    );

    // Not an image extension: query is ignored.
    assert_eq!(get(&app, "/robots.txt?width=10").await.status(), StatusCode::OK);
    // Query without transform keys.
    assert_eq!(get(&app, "/images/photo.jpg?v=3").await.status(), StatusCode::OK);
    assert_eq!(get(&app, "/nope.jpg").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_requests() {
    let (app, _, _dir) = test_app(|_| {}).await;

    assert_eq!(get(&app, "/images/photo.jpg?quality=150").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(get(&app, "/images/photo.jpg?width=abc").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(get(&app, "/images/missing.jpg?width=10").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&app, "/blobs/_ic~static/ic~nothing.jpg").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_media_blob_source() {
    let (app, state, _dir) = test_app(|s| s.stream_cached_image = true).await;
    state
        .cache
        .backend()
        .write("3f2a/cat.jpg", Bytes::from(jpeg(64, 64)), &WriteProps::default())
        .await
        .unwrap();

    let resp = get(&app, "/media/3f2a/cat.jpg?width=32&height=16&mode=crop").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let decoded = image::load_from_memory(&body_bytes(resp).await).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 16));

    let listed = state.cache.backend().list("3f2a/", None, 10).await.unwrap();
    let artifacts: Vec<_> = listed.items.iter().filter(|m| m.locator.starts_with("3f2a/ic~")).collect();
    assert_eq!(artifacts.len(), 1);

    // Artifacts cannot be requested as sources.
    let artifact_path = format!("/media/{}?width=10", artifacts[0].locator);
    assert_eq!(get(&app, &artifact_path).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_metrics_and_stats() {
    let (app, _, _dir) = test_app(|_| {}).await;
    get(&app, "/images/photo.jpg?width=50").await;

    let metrics = get(&app, "/metrics").await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(metrics).await.to_vec()).unwrap();
    assert!(text.contains("imagecache_cache_misses_total 1"));
    assert!(text.contains("imagecache_cache_stores_total 1"));

    let stats: Value = serde_json::from_slice(&body_bytes(get(&app, "/stats/cache").await).await).unwrap();
    assert_eq!(stats["index"]["entries"], 1);
    assert_eq!(stats["requests"]["cache_misses"], 1);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let public = dir.path().join("public");
    std::fs::create_dir_all(&public).unwrap();
    std::fs::write(public.join("a.jpg"), jpeg(80, 80)).unwrap();
    let settings = |root: &Path| CacheSettings {
        backend: BackendSettings::Fs { root: root.join("cache") },
        static_root: root.join("public"),
        ..Default::default()
    };

    let first = router(AppState::from_settings(settings(dir.path())).await.unwrap());
    assert_eq!(get(&first, "/a.jpg?width=40").await.status(), StatusCode::OK);

    let state = AppState::from_settings(settings(dir.path())).await.unwrap();
    let second = router(state.clone());
    assert_eq!(get(&second, "/a.jpg?width=40").await.status(), StatusCode::FOUND);
    assert_eq!(state.cache.metrics().snapshot().transforms, 0);
}
