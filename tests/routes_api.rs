#![cfg(feature = "inmem-store")]

use actix_web::{test, web, App};
use std::sync::Arc;
use std::time::Duration;

use lostpet::credential::{CredentialGuard, HashCost};
use lostpet::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use lostpet::repo::inmem::InMemRepo;
use lostpet::routes::{config, AppState, UPLOADS_ROUTE};
use lostpet::storage::FsBlobStore;
use lostpet::PostService;

fn sample_png() -> Vec<u8> {
    // Pre-generated 1x1 PNG file bytes
    vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, // signature
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, b'I',
        b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A,
        0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ]
}

fn sample_gif() -> Vec<u8> {
    b"GIF89a\x01\x00\x01\x00\x00\x00\x00;".to_vec()
}

const BOUNDARY: &str = "XBOUNDARYX";

// Builds a multipart/form-data body from text fields and `images` file parts
fn build_multipart(fields: &[(&str, &str)], images: &[(&str, Vec<u8>)]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes());
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for (filename, bytes) in images {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"images\"; filename=\"{filename}\"\r\n").as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

const REX: &[(&str, &str)] = &[
    ("pet_name", "Rex"),
    ("description", "Missing since Monday"),
    ("breed", "Labrador"),
    ("color", "Brown"),
    ("neighborhood", "Centro"),
    ("whatsapp", "+5511999999999"),
    ("adress", "Rua A, 10"),
    ("password", "paw1234"),
];

fn state(upload_root: &std::path::Path) -> AppState {
    let guard = CredentialGuard::new(HashCost { memory_kib: 64, iterations: 1, parallelism: 1 }).unwrap();
    let blobs = FsBlobStore::new(upload_root, UPLOADS_ROUTE);
    AppState::new(PostService::new(Arc::new(InMemRepo::new()), Arc::new(blobs), guard))
}

async fn read_json(resp: actix_web::dev::ServiceResponse) -> serde_json::Value {
    serde_json::from_slice(&test::read_body(resp).await).unwrap()
}

#[actix_web::test]
async fn post_lifecycle_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(tmp.path()))).configure(config)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
    assert!(resp.status().is_success());
    assert_eq!(read_json(resp).await["database"], "ok");

    let (ct, body) = build_multipart(REX, &[("a.png", sample_png()), ("b.gif", sample_gif())]);
    let req = test::TestRequest::post()
        .uri("/lost_dog_posts")
        .insert_header(("Content-Type", ct))
        .set_payload(body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let created = read_json(resp).await;
    let id = created["id"].as_i64().unwrap();
    let images = created["images"].as_array().unwrap().clone();
    assert_eq!(images.len(), 2);
    assert!(images[0].as_str().unwrap().starts_with(&format!("/uploads/posts/{id}/")));
    assert!(images[0].as_str().unwrap().ends_with(".png"));
    assert!(images[1].as_str().unwrap().ends_with(".gif"));

    // list
    let resp = test::call_service(&app, test::TestRequest::get().uri("/lost_dog_posts").to_request()).await;
    assert_eq!(resp.status(), 200);
    let list = read_json(resp).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["pet_name"], "Rex");
    assert_eq!(list[0]["address"], "Rua A, 10");
    assert!(list[0].get("credential_hash").is_none());
    assert!(list[0].get("password").is_none());

    // get
    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/lost_dog_posts/{id}")).to_request()).await;
    assert_eq!(resp.status(), 200);
    let post = read_json(resp).await;
    assert_eq!(post["images"][0]["url"], images[0]);
    assert_eq!(post["images"][1]["url"], images[1]);

    // photo served back with its sniffed type
    let resp = test::call_service(&app, test::TestRequest::get().uri(images[0].as_str().unwrap()).to_request()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("Content-Type").unwrap(), "image/png");
    assert_eq!(test::read_body(resp).await.to_vec(), sample_png());

    // wrong password
    let req = test::TestRequest::delete()
        .uri(&format!("/lost_dog_posts/{id}"))
        .set_json(serde_json::json!({"password": "nope"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/lost_dog_posts/{id}")).to_request()).await;
    assert_eq!(resp.status(), 200);

    // right password
    let req = test::TestRequest::delete()
        .uri(&format!("/lost_dog_posts/{id}"))
        .set_json(serde_json::json!({"password": "paw1234"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/lost_dog_posts/{id}")).to_request()).await;
    assert_eq!(resp.status(), 404);
    let resp = test::call_service(&app, test::TestRequest::get().uri(images[0].as_str().unwrap()).to_request()).await;
    assert_eq!(resp.status(), 404);
    let req = test::TestRequest::delete()
        .uri(&format!("/lost_dog_posts/{id}"))
        .set_json(serde_json::json!({"password": "paw1234"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
async fn create_rejects_invalid_submissions() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(tmp.path()))).configure(config)).await;

    // missing description and breed
    let fields: Vec<_> = REX.iter().copied().filter(|(k, _)| *k != "description" && *k != "breed").collect();
    let (ct, body) = build_multipart(&fields, &[("a.png", sample_png())]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let err = read_json(resp).await;
    let msg = err["error"].as_str().unwrap();
    assert!(msg.contains("description") && msg.contains("breed"), "{msg}");

    // no images
    let (ct, body) = build_multipart(REX, &[]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // not an image
    let (ct, body) = build_multipart(REX, &[("notes.txt", b"hello there".to_vec())]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    // no password
    let fields: Vec<_> = REX.iter().copied().filter(|(k, _)| *k != "password").collect();
    let (ct, body) = build_multipart(&fields, &[("a.png", sample_png())]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/lost_dog_posts").to_request()).await;
    assert_eq!(read_json(resp).await.as_array().unwrap().len(), 0);
    // nothing written to disk either
    assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
}

#[actix_web::test]
async fn list_filters_by_query() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(tmp.path()))).configure(config)).await;

    for (breed, color) in [("Labrador", "Brown"), ("Labrador", "Black"), ("Poodle", "White")] {
        let mut fields: Vec<_> = REX.iter().copied().filter(|(k, _)| *k != "breed" && *k != "color").collect();
        fields.push(("breed", breed));
        fields.push(("color", color));
        let (ct, body) = build_multipart(&fields, &[("a.png", sample_png())]);
        let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);
    }

    let count = |uri: &'static str| {
        let app = &app;
        async move {
            let resp = test::call_service(app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), 200);
            read_json(resp).await.as_array().unwrap().len()
        }
    };
    assert_eq!(count("/lost_dog_posts").await, 3);
    assert_eq!(count("/lost_dog_posts?breed=Labrador").await, 2);
    assert_eq!(count("/lost_dog_posts?breed=Labrador&color=Black").await, 1);
    assert_eq!(count("/lost_dog_posts?breed=Poodle&neighborhood=Lapa").await, 0);
    assert_eq!(count("/lost_dog_posts?breed=&color=").await, 3);
}

#[actix_web::test]
async fn unknown_post_and_bad_locator_are_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let app = test::init_service(App::new().app_data(web::Data::new(state(tmp.path()))).configure(config)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/lost_dog_posts/9999").to_request()).await;
    assert_eq!(resp.status(), 404);
    let req = test::TestRequest::delete()
        .uri("/lost_dog_posts/9999")
        .set_json(serde_json::json!({"password": "x"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/uploads/posts/1/missing.png").to_request()).await;
    assert_eq!(resp.status(), 404);
    // metrics recorder not installed in tests
    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn delete_is_rate_limited() {
    let tmp = tempfile::tempdir().unwrap();
    let mut st = state(tmp.path());
    st.rate_limiter = Some(RateLimiterFacade::new(
        InMemoryRateLimiter::new(true),
        RateLimitConfig {
            create_limit: 5,
            create_window: Duration::from_secs(60),
            delete_limit: 2,
            delete_window: Duration::from_secs(60),
        },
    ));
    let app = test::init_service(App::new().app_data(web::Data::new(st)).configure(config)).await;

    let (ct, body) = build_multipart(REX, &[("a.png", sample_png())]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    let id = read_json(test::call_service(&app, req).await).await["id"].as_i64().unwrap();

    let attempt = |pw: &'static str| {
        test::TestRequest::delete()
            .uri(&format!("/lost_dog_posts/{id}"))
            .set_json(serde_json::json!({ "password": pw }))
            .to_request()
    };
    assert_eq!(test::call_service(&app, attempt("guess1")).await.status(), 403);
    assert_eq!(test::call_service(&app, attempt("guess2")).await.status(), 403);
    // limiter stops further guessing, even with the right secret
    assert_eq!(test::call_service(&app, attempt("paw1234")).await.status(), 429);
    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/lost_dog_posts/{id}")).to_request()).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn uploads_follow_configured_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = "https://pets.example.com/uploads";
    let guard = CredentialGuard::new(HashCost { memory_kib: 64, iterations: 1, parallelism: 1 }).unwrap();
    let blobs = FsBlobStore::new(tmp.path(), prefix);
    let st = AppState::new(PostService::new(Arc::new(InMemRepo::new()), Arc::new(blobs), guard)).with_upload_prefix(prefix);
    let app = test::init_service(App::new().app_data(web::Data::new(st)).configure(config)).await;

    let (ct, body) = build_multipart(REX, &[("a.png", sample_png())]);
    let req = test::TestRequest::post().uri("/lost_dog_posts").insert_header(("Content-Type", ct)).set_payload(body).to_request();
    let created = read_json(test::call_service(&app, req).await).await;
    let locator = created["images"][0].as_str().unwrap().to_string();
    let path = locator.strip_prefix("https://pets.example.com").unwrap();
    assert!(path.starts_with("/uploads/posts/"));

    let resp = test::call_service(&app, test::TestRequest::get().uri(path).to_request()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(test::read_body(resp).await.to_vec(), sample_png());
}
