pub mod analyze;
pub mod auth;
pub mod error;
pub mod middleware;
pub mod results;
pub mod storage;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::error;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::middleware::require_auth;

/// Build the application router. Transport layers (CORS, tracing) are added
/// by the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .nest_service("/results", ServeDir::new(state.store.results_dir()));

    let protected_routes = Router::new()
        .route("/analyze", post(analyze::analyze))
        .route("/analyze_realtime", post(analyze::analyze_realtime))
        .route("/save_result", post(results::save_result))
        .route("/history", get(results::history))
        .route("/history/{result_id}", delete(results::delete_result))
        .route("/delete_result/{result_id}", post(results::delete_result))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Run blocking work (SQLite, hashing, image codecs) off the async runtime.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("blocking task failed: {e}"))
        })?
        .map_err(ApiError::Internal)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use tower::ServiceExt;

    use emolens_analysis::{AnalyzerError, EmotionAnalyzer, RawFace};
    use emolens_db::Database;
    use emolens_types::models::Region;

    use super::*;
    use crate::auth::{AUTH_COOKIE, AppStateInner};
    use crate::storage::ImageStore;

    const BOUNDARY: &str = "emolens-test-boundary";

    /// Replies with canned faces, or fails when `faces` is `None`.
    struct StubAnalyzer {
        faces: Option<Vec<RawFace>>,
    }

    #[async_trait]
    impl EmotionAnalyzer for StubAnalyzer {
        async fn analyze(&self, _image: Bytes, _content_type: &str) -> Result<Vec<RawFace>, AnalyzerError> {
            self.faces
                .clone()
                .ok_or_else(|| AnalyzerError::Status {
                    status: 500,
                    body: "Traceback: /opt/model/serve.py line 42".into(),
                })
        }
    }

    fn one_face() -> Vec<RawFace> {
        vec![RawFace {
            region: Some(Region { x: 8, y: 16, w: 24, h: 24 }),
            emotion: [("happy", 2.0), ("neutral", 1.0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }]
    }

    struct TestApp {
        app: Router,
        root: PathBuf,
    }

    impl TestApp {
        async fn new(faces: Option<Vec<RawFace>>) -> Self {
            let root = std::env::temp_dir().join(format!("emolens-api-{}", uuid::Uuid::new_v4()));
            let store = ImageStore::new(root.join("uploads"), root.join("results"))
                .await
                .unwrap();

            let state: AppState = Arc::new(AppStateInner {
                db: Database::open_in_memory().unwrap(),
                store,
                analyzer: Arc::new(StubAnalyzer { faces }),
                jwt_secret: "test-secret".into(),
                token_ttl: chrono::Duration::hours(1),
                secure_cookies: false,
                display_offset: chrono::FixedOffset::east_opt(5 * 3600).unwrap(),
                max_upload_bytes: 1024 * 1024,
            });

            Self {
                app: router(state),
                root,
            }
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let headers = resp.headers().clone();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, headers, body)
        }

        async fn post_json(&self, uri: &str, session: Option<&str>, body: Value) -> (StatusCode, axum::http::HeaderMap, Value) {
            let mut req = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
            if let Some(cookie) = session {
                req = req.header(header::COOKIE, cookie);
            }
            self.send(req.body(Body::from(body.to_string())).unwrap()).await
        }

        async fn upload(&self, uri: &str, session: &str, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
            let mut body = format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .into_bytes();
            body.extend_from_slice(data);
            body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

            let req = Request::post(uri)
                .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
                .header(header::COOKIE, session)
                .body(Body::from(body))
                .unwrap();
            let (status, _, body) = self.send(req).await;
            (status, body)
        }

        async fn get(&self, uri: &str, session: Option<&str>) -> (StatusCode, Value) {
            let mut req = Request::get(uri);
            if let Some(cookie) = session {
                req = req.header(header::COOKIE, cookie);
            }
            let (status, _, body) = self.send(req.body(Body::empty()).unwrap()).await;
            (status, body)
        }

        /// Register and log in, returning the `Cookie` header value.
        async fn session(&self, username: &str) -> String {
            let (status, _, _) = self
                .post_json(
                    "/register",
                    None,
                    json!({"username": username, "password": "secret1", "confirm_password": "secret1"}),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);

            let (status, headers, body) = self
                .post_json("/login", None, json!({"username": username, "password": "secret1"}))
                .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["username"], username);

            let set_cookie = headers
                .get(header::SET_COOKIE)
                .and_then(|v| v.to_str().ok())
                .unwrap();
            assert!(set_cookie.contains("HttpOnly"));
            let pair = set_cookie.split(';').next().unwrap().to_string();
            assert!(pair.starts_with(AUTH_COOKIE));
            pair
        }

        fn upload_count(&self) -> usize {
            std::fs::read_dir(self.root.join("uploads")).unwrap().count()
        }
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.root).ok();
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 10, 10])))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn analyze_save_history_delete_flow() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;

        let (status, analysis) = t.upload("/analyze", &session, "my face.png", &png(64, 64)).await;
        assert_eq!(status, StatusCode::OK, "{analysis}");

        let image_id = analysis["image_id"].as_str().unwrap().to_string();
        assert!(image_id.ends_with("_my_face.png"));
        assert_eq!(analysis["result_image_url"], format!("/results/{image_id}"));

        let face = &analysis["results"][0];
        assert_eq!(face["dominant_emotion"], "happy");
        let confidence = face["confidence"].as_f64().unwrap();
        assert!((confidence - 200.0 / 3.0).abs() < 1e-9);
        let total: f64 = face["emotions"].as_object().unwrap().values().map(|v| v.as_f64().unwrap()).sum();
        assert!((total - 100.0).abs() < 1e-9);

        assert!(t.root.join("uploads").join(&image_id).exists());
        let annotated = t.root.join("results").join(&image_id);
        let decoded = image::open(&annotated).unwrap().to_rgb8();
        assert_eq!(*decoded.get_pixel(8, 16), Rgb([0, 255, 0]));

        let served = t
            .app
            .clone()
            .oneshot(Request::get(format!("/results/{image_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(served.status(), StatusCode::OK);

        // Clients post the analysis response straight back
        let (status, _, saved) = t.post_json("/save_result", Some(session.as_str()), analysis.clone()).await;
        assert_eq!(status, StatusCode::OK, "{saved}");
        assert_eq!(saved["saved"], 1);

        let (status, history) = t.get("/history", Some(session.as_str())).await;
        assert_eq!(status, StatusCode::OK);
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["image_id"], image_id.as_str());
        assert_eq!(entries[0]["dominant_emotion"], "happy");
        assert!(entries[0]["emotions"]["neutral"].as_f64().is_some());
        assert!(entries[0]["local_time"].as_str().is_some());

        let result_id = entries[0]["id"].as_str().unwrap();
        let req = Request::delete(format!("/history/{result_id}"))
            .header(header::COOKIE, &session)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = t.send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        assert!(!t.root.join("uploads").join(&image_id).exists());
        assert!(!annotated.exists());
        let (_, history) = t.get("/history", Some(session.as_str())).await;
        assert!(history.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_image_files_survive_until_last_result_is_deleted() {
        let two_faces = [one_face(), one_face()].concat();
        let t = TestApp::new(Some(two_faces)).await;
        let session = t.session("alice").await;

        let (_, analysis) = t.upload("/analyze", &session, "pair.png", &png(64, 64)).await;
        let image_id = analysis["image_id"].as_str().unwrap().to_string();
        let (_, _, saved) = t.post_json("/save_result", Some(session.as_str()), analysis).await;
        assert_eq!(saved["saved"], 2);

        let (_, history) = t.get("/history", Some(session.as_str())).await;
        let ids: Vec<String> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect();

        let (status, _, _) = t.post_json(&format!("/delete_result/{}", ids[0]), Some(session.as_str()), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(t.root.join("uploads").join(&image_id).exists());

        let (status, _, _) = t.post_json(&format!("/delete_result/{}", ids[1]), Some(session.as_str()), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!t.root.join("uploads").join(&image_id).exists());
    }

    #[tokio::test]
    async fn protected_routes_require_a_session() {
        let t = TestApp::new(Some(one_face())).await;

        let (status, body) = t.get("/history", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = t.get("/history", Some(format!("{AUTH_COOKIE}=not-a-jwt").as_str())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let t = TestApp::new(Some(one_face())).await;
        t.session("alice").await;

        let (_, _, login) = t
            .post_json("/login", None, json!({"username": "alice", "password": "secret1"}))
            .await;
        let token = login["token"].as_str().unwrap();

        let req = Request::get("/history")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = t.send(req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn registration_and_login_errors() {
        let t = TestApp::new(Some(one_face())).await;
        t.session("alice").await;

        let (status, _, body) = t
            .post_json(
                "/register",
                None,
                json!({"username": "alice", "password": "secret1", "confirm_password": "secret1"}),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already exists"));

        let (status, _, _) = t
            .post_json(
                "/register",
                None,
                json!({"username": "bob", "password": "weak", "confirm_password": "weak"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = t
            .post_json(
                "/register",
                None,
                json!({"username": "bob", "password": "secret1", "confirm_password": "secret2"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = t
            .post_json("/login", None, json!({"username": "alice", "password": "wrong1"}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = t
            .post_json("/login", None, json!({"username": "nobody", "password": "secret1"}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;

        let (status, headers, body) = t.post_json("/logout", Some(session.as_str()), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let cleared = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.starts_with(&format!("{AUTH_COOKIE}=")));
        assert!(cleared.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn cannot_touch_other_users_results() {
        let t = TestApp::new(Some(one_face())).await;
        let alice = t.session("alice").await;
        let mallory = t.session("mallory").await;

        let (_, analysis) = t.upload("/analyze", &alice, "a.png", &png(48, 48)).await;
        t.post_json("/save_result", Some(alice.as_str()), analysis).await;
        let (_, history) = t.get("/history", Some(alice.as_str())).await;
        let result_id = history[0]["id"].as_str().unwrap().to_string();

        let (status, _) = t.get("/history", Some(mallory.as_str())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = t
            .post_json(&format!("/delete_result/{result_id}"), Some(mallory.as_str()), json!({}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let unknown = uuid::Uuid::new_v4();
        let (status, _, _) = t
            .post_json(&format!("/delete_result/{unknown}"), Some(alice.as_str()), json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, history) = t.get("/history", Some(alice.as_str())).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_the_uploader_can_save_results_for_an_image() {
        let t = TestApp::new(Some(one_face())).await;
        let alice = t.session("alice").await;
        let mallory = t.session("mallory").await;

        let (_, analysis) = t.upload("/analyze", &alice, "a.png", &png(48, 48)).await;
        let image_id = analysis["image_id"].as_str().unwrap().to_string();

        let (status, _, body) = t.post_json("/save_result", Some(mallory.as_str()), analysis.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Unknown image");
        let (_, history) = t.get("/history", Some(mallory.as_str())).await;
        assert!(history.as_array().unwrap().is_empty());

        let (status, _, _) = t.post_json("/save_result", Some(alice.as_str()), analysis).await;
        assert_eq!(status, StatusCode::OK);
        let (_, history) = t.get("/history", Some(alice.as_str())).await;
        let result_id = history[0]["id"].as_str().unwrap().to_string();

        let (status, _, _) = t
            .post_json(&format!("/delete_result/{result_id}"), Some(alice.as_str()), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!t.root.join("uploads").join(&image_id).exists());
        assert!(!t.root.join("results").join(&image_id).exists());
    }

    #[tokio::test]
    async fn rejected_tokens_get_401() {
        let t = TestApp::new(Some(one_face())).await;
        t.session("alice").await;
        let id = uuid::Uuid::new_v4();

        let expired = auth::create_token("test-secret", id, "alice", chrono::Duration::hours(-2)).unwrap();
        let forged = auth::create_token("someone-else", id, "alice", chrono::Duration::hours(1)).unwrap();

        for token in [&expired, &forged] {
            let req = Request::get("/history")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            let (status, _, body) = t.send(req).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["error"], "Authentication required");

            let (status, _) = t.get("/history", Some(format!("{AUTH_COOKIE}={token}").as_str())).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn session_cookie_takes_precedence_over_bearer() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;
        let (_, _, login) = t
            .post_json("/login", None, json!({"username": "alice", "password": "secret1"}))
            .await;
        let token = login["token"].as_str().unwrap().to_string();

        let req = Request::get("/history")
            .header(header::COOKIE, &session)
            .header(header::AUTHORIZATION, "Bearer garbage")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = t.send(req).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::get("/history")
            .header(header::COOKIE, format!("{AUTH_COOKIE}=garbage"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = t.send(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn concurrent_registrations_admit_one_user() {
        let t = TestApp::new(None).await;
        let body = json!({"username": "alice", "password": "secret1", "confirm_password": "secret1"});

        let (a, b, c) = tokio::join!(
            t.post_json("/register", None, body.clone()),
            t.post_json("/register", None, body.clone()),
            t.post_json("/register", None, body.clone()),
        );

        let mut statuses = vec![a.0, b.0, c.0];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT, StatusCode::CONFLICT]);
    }

    #[tokio::test]
    async fn save_rejects_unknown_images_and_bad_payloads() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;
        let face = json!({"dominant_emotion": "happy", "confidence": 50.0, "emotions": {"happy": 50.0}});

        let (status, _, _) = t
            .post_json("/save_result", Some(session.as_str()), json!({"image_id": "../users.db", "results": [face.clone()]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = t
            .post_json("/save_result", Some(session.as_str()), json!({"image_id": "missing.png", "results": [face]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, analysis) = t.upload("/analyze", &session, "a.png", &png(32, 32)).await;
        let image_id = analysis["image_id"].clone();

        let (status, _, body) = t
            .post_json("/save_result", Some(session.as_str()), json!({"image_id": image_id, "results": []}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No results provided");

        let bad = json!({"dominant_emotion": "happy", "confidence": 250.0, "emotions": {}});
        let (status, _, _) = t
            .post_json("/save_result", Some(session.as_str()), json!({"image_id": image_id, "results": [bad]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, history) = t.get("/history", Some(session.as_str())).await;
        assert!(history.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn analyze_rejects_non_images_without_storing() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;

        let (status, body) = t.upload("/analyze", &session, "notes.txt", b"hello there").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(t.upload_count(), 0);
    }

    #[tokio::test]
    async fn analyzer_failure_discards_upload() {
        let t = TestApp::new(None).await;
        let session = t.session("alice").await;

        let (status, body) = t.upload("/analyze", &session, "a.png", &png(16, 16)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Analysis failed");
        assert!(!body.to_string().contains("Traceback"));
        assert_eq!(t.upload_count(), 0);
        assert_eq!(std::fs::read_dir(t.root.join("results")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn realtime_rounds_and_stores_nothing() {
        let t = TestApp::new(Some(one_face())).await;
        let session = t.session("alice").await;

        let (status, body) = t.upload("/analyze_realtime", &session, "frame.png", &png(32, 32)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["confidence"].as_f64().unwrap(), 66.67);
        assert!(body.get("image_id").is_none());
        assert_eq!(t.upload_count(), 0);
    }

    #[tokio::test]
    async fn realtime_without_faces_is_bad_request() {
        let t = TestApp::new(Some(vec![])).await;
        let session = t.session("alice").await;

        let (status, body) = t.upload("/analyze_realtime", &session, "frame.png", &png(32, 32)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No result from analyzer");
    }

    #[tokio::test]
    async fn health_is_public() {
        let t = TestApp::new(None).await;
        let (status, body) = t.get("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
