use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::lifecycle::PostService;
use crate::models::*;
use crate::rate_limit::RateLimiterFacade;
use crate::storage::BlobStoreError;

/// Path the local blob store's locators are served under.
pub const UPLOADS_ROUTE: &str = "/uploads";

const TEXT_FIELD_LIMIT: usize = 16 * 1024;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(health)))
        .service(
            web::resource("/lost_dog_posts")
                .route(web::get().to(list_posts))
                .route(web::post().to(create_post)),
        )
        .service(
            web::resource("/lost_dog_posts/{id}")
                .route(web::get().to(get_post))
                .route(web::delete().to(delete_post)),
        )
        .service(web::resource("/metrics").route(web::get().to(render_metrics)))
        .route(&format!("{UPLOADS_ROUTE}/{{key:.*}}"), web::get().to(get_upload));
}

#[derive(Clone)]
pub struct AppState {
    pub service: PostService,
    pub rate_limiter: Option<RateLimiterFacade>,
    pub metrics: Option<PrometheusHandle>,
    /// Prefix the local blob store builds its locators from.
    pub upload_prefix: String,
}

impl AppState {
    pub fn new(service: PostService) -> Self {
        Self { service, rate_limiter: None, metrics: None, upload_prefix: UPLOADS_ROUTE.to_string() }
    }

    pub fn with_upload_prefix(mut self, prefix: &str) -> Self {
        self.upload_prefix = prefix.trim_end_matches('/').to_string();
        self
    }
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub description: String,
    pub database: String,
}

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service and database status", body = HealthResponse))
)]
pub async fn health(data: web::Data<AppState>) -> HttpResponse {
    let database = match data.service.repo().ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    HttpResponse::Ok().json(HealthResponse { description: "Lost pet listings API".into(), database })
}

#[utoipa::path(
    get,
    path = "/lost_dog_posts",
    params(PostFilter),
    responses(
        (status = 200, description = "Matching posts, newest first", body = [Post]),
        (status = 500, description = "Storage unavailable", body = ApiErrorBody)
    )
)]
pub async fn list_posts(data: web::Data<AppState>, query: web::Query<PostFilter>) -> Result<HttpResponse, ApiError> {
    let posts = data.service.list_posts(query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/lost_dog_posts/{id}",
    params(("id" = i64, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post with its images", body = Post),
        (status = 404, description = "Post not found", body = ApiErrorBody)
    )
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.service.get_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatePostResponse {
    pub message: String,
    pub id: Id,
    pub images: Vec<String>,
}

#[utoipa::path(
    post,
    path = "/lost_dog_posts",
    request_body(
        content = PostFields,
        content_type = "multipart/form-data",
        description = "Text fields plus a `password` field and one or more `images` file parts"
    ),
    responses(
        (status = 201, description = "Post created", body = CreatePostResponse),
        (status = 400, description = "Invalid or missing fields", body = ApiErrorBody),
        (status = 413, description = "Image too large"),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn create_post(req: HttpRequest, data: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_create(&client_ip(&req)) {
            return Err(ApiError::TooManyRequests);
        }
    }
    let limits = data.service.limits();
    let mut fields = PostFields::default();
    let mut secret = String::new();
    let mut attachments: Vec<Attachment> = Vec::new();

    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        log::warn!("multipart error: {e}");
        ApiError::BadRequest("malformed multipart body".into())
    })? {
        let name = field.content_disposition().get_name().unwrap_or_default().to_string();
        let file_name = field.content_disposition().get_filename().map(str::to_string);
        let is_image = name == "images";
        if is_image && attachments.len() >= limits.max_attachments {
            return Err(ApiError::BadRequest(
                ValidationError::TooManyAttachments { max: limits.max_attachments }.to_string(),
            ));
        }
        let limit = if is_image { limits.max_bytes } else { TEXT_FIELD_LIMIT };
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| {
            log::warn!("stream read error: {e}");
            ApiError::BadRequest("malformed multipart body".into())
        })? {
            if bytes.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        if is_image {
            attachments.push(Attachment { file_name, bytes });
            continue;
        }
        let text = String::from_utf8(bytes).map_err(|_| ApiError::BadRequest(format!("field {name} is not valid UTF-8")))?;
        match name.as_str() {
            "pet_name" => fields.pet_name = Some(text),
            "description" => fields.description = Some(text),
            "breed" => fields.breed = Some(text),
            "color" => fields.color = Some(text),
            "neighborhood" => fields.neighborhood = Some(text),
            "accessory" => fields.accessory = Some(text),
            "location_reference" => fields.location_reference = Some(text),
            "whatsapp" => fields.whatsapp = Some(text),
            "instagram" => fields.instagram = Some(text),
            "pet_age" => fields.pet_age = Some(text),
            "address" | "adress" => fields.address = Some(text),
            "password" => secret = text,
            other => log::debug!("ignoring unknown form field '{other}'"),
        }
    }

    let created = data.service.create_post(fields, attachments, &secret).await?;
    Ok(HttpResponse::Created().json(CreatePostResponse {
        message: "post created".into(),
        id: created.id,
        images: created.images,
    }))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletePostRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletePostResponse {
    pub message: String,
}

#[utoipa::path(
    delete,
    path = "/lost_dog_posts/{id}",
    params(("id" = i64, Path, description = "Post id")),
    request_body = DeletePostRequest,
    responses(
        (status = 200, description = "Post deleted", body = DeletePostResponse),
        (status = 403, description = "Wrong password", body = ApiErrorBody),
        (status = 404, description = "Post not found", body = ApiErrorBody),
        (status = 429, description = "Rate limited")
    )
)]
pub async fn delete_post(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<DeletePostRequest>,
) -> Result<HttpResponse, ApiError> {
    if let Some(rl) = &data.rate_limiter {
        if !rl.allow_delete(&client_ip(&req)) {
            return Err(ApiError::TooManyRequests);
        }
    }
    data.service.delete_post(path.into_inner(), &payload.password).await?;
    Ok(HttpResponse::Ok().json(DeletePostResponse { message: "post deleted".into() }))
}

/// Serves photos written by the local blob store.
pub async fn get_upload(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let locator = format!("{}/{}", data.upload_prefix, path.into_inner());
    match data.service.blobs().load(&locator).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok().insert_header(("Content-Type", mime)).body(bytes)),
        Err(BlobStoreError::NotFound | BlobStoreError::InvalidLocator(_)) => Err(ApiError::NotFound),
        Err(e) => {
            log::error!("blob load error: {e}");
            Err(ApiError::Internal)
        }
    }
}

pub async fn render_metrics(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let handle = data.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render()))
}
