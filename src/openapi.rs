use crate::error::ApiErrorBody;
use crate::models::{Post, PostFields, PostFilter, PostImage};
use crate::routes::{CreatePostResponse, DeletePostRequest, DeletePostResponse, HealthResponse};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health,
        crate::routes::list_posts,
        crate::routes::get_post,
        crate::routes::create_post,
        crate::routes::delete_post,
    ),
    components(schemas(
        Post, PostImage, PostFields, PostFilter, ApiErrorBody,
        CreatePostResponse, DeletePostRequest, DeletePostResponse, HealthResponse
    )),
    tags(
        (name = "posts", description = "Lost pet listings"),
    )
)]
pub struct ApiDoc;
