use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use macfind_api::middleware::create_token;
use macfind_api::storage::Storage;
use macfind_api::vision::{VisionClient, VisionError};
use macfind_api::{AppState, AppStateInner};
use macfind_db::Database;
use macfind_gateway::dispatcher::Dispatcher;

use super::app;

const SECRET: &str = "test-secret";
const BOUNDARY: &str = "macfind-test-boundary";

struct FakeVision;

#[async_trait]
impl VisionClient for FakeVision {
    async fn describe(&self, _image: &[u8], _mime_type: &str) -> Result<String, VisionError> {
        Ok("```json\n{\"object_type\": \"water bottle\", \"color\": \"blue\"}\n```".into())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    state: AppState,
}

impl Harness {
    async fn new(vision: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("objects"), "http://localhost:3001")
            .await
            .unwrap();
        let state = Arc::new(AppStateInner {
            db: Database::open_in_memory().unwrap(),
            dispatcher: Dispatcher::new(),
            storage,
            vision: vision.then(|| Arc::new(FakeVision) as Arc<dyn VisionClient>),
            jwt_secret: SECRET.into(),
            site_url: "http://localhost:5173".into(),
            email_domain: "mcmaster.ca".into(),
        });
        Self { _dir: dir, state }
    }

    /// Signed-in user with an identity but no profile row yet.
    fn sign_in(&self, email: &str) -> (Uuid, String) {
        let id = self.state.db.upsert_identity(email).unwrap();
        (id, create_token(SECRET, id, email).unwrap())
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = app(self.state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::get(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    async fn json(&self, method: &str, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(req.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn multipart(&self, uri: &str, token: &str, fields: &[(&str, &str)], image: Option<&[u8]>) -> (StatusCode, Value) {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some(image) = image {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"bottle.png\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY
                )
                .as_bytes(),
            );
            body.extend_from_slice(image);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        let req = Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    /// Post a found item with a photo and return its id.
    async fn post_item(&self, token: &str) -> Uuid {
        let (status, body) = self
            .multipart(
                "/items",
                token,
                &[("description", "blue water bottle"), ("location", "Mills Library"), ("tags", "Bottle, blue")],
                Some(b"\x89PNG fake"),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }
}

#[tokio::test]
async fn health_is_public() {
    let h = Harness::new(false).await;
    let response = app(h.state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_need_a_token() {
    let h = Harness::new(false).await;
    assert_eq!(h.get("/messages/unread", None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(h.get("/messages/unread", Some("not-a-jwt")).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn magic_link_rejects_other_domains() {
    let h = Harness::new(false).await;
    let (status, body) = h
        .json("POST", "/auth/magic-link", None, json!({ "email": "someone@gmail.com" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("mcmaster.ca"));

    let (status, body) = h
        .json("POST", "/auth/magic-link", None, json!({ "email": " SmithJ@McMaster.ca " }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["sent_to"], "smithj@mcmaster.ca");
}

#[tokio::test]
async fn verify_then_session_creates_profile() {
    let h = Harness::new(false).await;
    let expires = chrono::Utc::now() + chrono::Duration::minutes(15);
    h.state.db.create_login_token("tok", "smithj@mcmaster.ca", expires).unwrap();

    let (status, body) = h.json("POST", "/auth/verify", None, json!({ "token": "tok" })).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    // Single use.
    let (status, _) = h.json("POST", "/auth/verify", None, json!({ "token": "tok" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = h.get("/auth/session", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["profile"]["display_name"], "smithj");
}

#[tokio::test]
async fn post_found_requires_image_before_any_write() {
    let h = Harness::new(false).await;
    let (_, token) = h.sign_in("finder@mcmaster.ca");

    let (status, _) = h
        .multipart("/items", &token, &[("description", "black backpack")], None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, items) = h.get("/items", None).await;
    assert_eq!(items.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn post_found_creates_profile_and_stores_photo() {
    let h = Harness::new(false).await;
    let (finder, token) = h.sign_in("finder@mcmaster.ca");
    assert!(h.state.db.get_user(finder).unwrap().is_none());

    let item_id = h.post_item(&token).await;
    assert!(h.state.db.get_user(finder).unwrap().is_some());

    let (status, item) = h.get(&format!("/items/{}", item_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["status"], "found");
    assert_eq!(item["metadata"]["tags"], json!(["bottle", "blue"]));
    assert!(item["metadata"]["suggested_tags"].as_array().unwrap().contains(&json!("mills")));

    let url = item["images"][0]["url"].as_str().unwrap();
    assert!(url.starts_with(&format!("http://localhost:3001/storage/item-images/{}/", item_id)));
    assert!(url.ends_with(".png"));

    let path = url.trim_start_matches("http://localhost:3001");
    let response = app(h.state.clone())
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

    let (_, listed) = h.get("/items?status=found&location=mills&time_range=24h", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn only_the_poster_can_delete() {
    let h = Harness::new(false).await;
    let (_, finder) = h.sign_in("finder@mcmaster.ca");
    let (_, stranger) = h.sign_in("stranger@mcmaster.ca");
    let item_id = h.post_item(&finder).await;

    let (status, _) = h.json("DELETE", &format!("/items/{}", item_id), Some(&stranger), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = h.json("DELETE", &format!("/items/{}", item_id), Some(&finder), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    assert_eq!(h.get(&format!("/items/{}", item_id), None).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn claim_thread_read_and_handshake_statuses() {
    let h = Harness::new(false).await;
    let (finder_id, finder) = h.sign_in("finder@mcmaster.ca");
    let (claimant_id, claimant) = h.sign_in("claimant@mcmaster.ca");
    let item_id = h.post_item(&finder).await;

    let (status, claim) = h
        .json("POST", &format!("/items/{}/claim", item_id), Some(&claimant), json!({ "proof": "has my initials" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(claim["content"]["body"], "CLAIM: has my initials");
    assert_eq!(claim["sender_handle"], "claimant");

    let (_, unread) = h.get("/messages/unread", Some(&finder)).await;
    assert_eq!(unread.as_array().unwrap().len(), 1);

    let read_uri = format!("/items/{}/threads/{}/read", item_id, claimant_id);
    let (_, first) = h.json("POST", &read_uri, Some(&finder), json!({})).await;
    let (_, second) = h.json("POST", &read_uri, Some(&finder), json!({})).await;
    assert_eq!(first["updated"], 1);
    assert_eq!(second["updated"], 0);

    // Having a thread is not enough to close the item.
    let status_uri = format!("/items/{}/status", item_id);
    let (status, _) = h.json("PATCH", &status_uri, Some(&claimant), json!({ "status": "claimed" })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Legacy sentinel body is stored as a claimant confirmation.
    let (_, found) = h
        .json(
            "POST",
            &format!("/items/{}/messages", item_id),
            Some(&claimant),
            json!({ "receiver_id": finder_id, "body": "STATUS:FOUND_CONFIRMED" }),
        )
        .await;
    assert_eq!(found["content"], json!({ "type": "confirm", "role": "claimant", "kind": "found" }));

    let (_, returned) = h
        .json(
            "POST",
            &format!("/items/{}/messages", item_id),
            Some(&finder),
            json!({ "receiver_id": claimant_id, "confirm": "returned" }),
        )
        .await;
    assert_eq!(returned["content"]["role"], "finder");

    let (_, thread) = h
        .get(&format!("/items/{}/messages?with={}", item_id, finder_id), Some(&claimant))
        .await;
    assert_eq!(thread.as_array().unwrap().len(), 3);

    let (_, threads) = h.get(&format!("/items/{}/threads", item_id), Some(&finder)).await;
    assert_eq!(threads[0]["counterparty_id"], claimant_id.to_string());

    let (status, _) = h.json("PATCH", &status_uri, Some(&claimant), json!({ "status": "claimed" })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h.json("PATCH", &status_uri, Some(&finder), json!({ "status": "found" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn vision_upload_labels_item() {
    let h = Harness::new(true).await;
    let (_, token) = h.sign_in("finder@mcmaster.ca");

    let (status, body) = h.multipart("/api/upload-item", &token, &[], Some(b"jpeg")).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["item"]["object_type"], "water bottle");
    assert_eq!(body["item"]["vague_description"], "blue water bottle");

    let (status, body) = h.multipart("/api/upload-item", &token, &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Image is required");
}

#[tokio::test]
async fn vision_upload_without_key_is_a_server_error() {
    let h = Harness::new(false).await;
    let (_, token) = h.sign_in("finder@mcmaster.ca");
    let (status, body) = h.multipart("/api/upload-item", &token, &[], Some(b"jpeg")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("not configured"));
}
