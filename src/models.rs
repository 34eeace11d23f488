use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub type Id = i64;

/// One lost-pet listing as readers see it. The deletion credential never
/// leaves the repository, so it has no field here.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Post {
    pub id: Id,
    pub pet_name: String,
    pub description: String,
    pub breed: String,
    pub color: String,
    pub neighborhood: String,
    pub accessory: Option<String>,
    pub location_reference: Option<String>,
    pub whatsapp: Option<String>,
    pub instagram: Option<String>,
    pub pet_age: Option<i32>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub images: Vec<PostImage>, // insertion order, first one is the primary photo
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct PostImage {
    pub id: Id,
    pub url: String,
}

/// Raw field bag as submitted by a form. Nothing here is trusted until
/// [`PostFields::validate`] turns it into a [`NewPost`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PostFields {
    pub pet_name: Option<String>,
    pub description: Option<String>,
    pub breed: Option<String>,
    pub color: Option<String>,
    pub neighborhood: Option<String>,
    pub accessory: Option<String>,
    pub location_reference: Option<String>,
    pub whatsapp: Option<String>,
    pub instagram: Option<String>,
    pub pet_age: Option<String>,
    #[serde(alias = "adress")]
    pub address: Option<String>,
}

/// Validated creation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub pet_name: String,
    pub description: String,
    pub breed: String,
    pub color: String,
    pub neighborhood: String,
    pub accessory: Option<String>,
    pub location_reference: Option<String>,
    pub whatsapp: Option<String>,
    pub instagram: Option<String>,
    pub pet_age: Option<i32>,
    pub address: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("at least one contact (whatsapp or instagram) is required")]
    NoContact,
    #[error("pet_age must be a non-negative integer")]
    InvalidAge,
    #[error("at least one image is required")]
    NoAttachments,
    #[error("too many images (max {max})")]
    TooManyAttachments { max: usize },
    #[error("image {index} exceeds {max_bytes} bytes")]
    AttachmentTooLarge { index: usize, max_bytes: usize },
    #[error("image {index} has unsupported type {mime}")]
    UnsupportedMedia { index: usize, mime: String },
}

fn clean(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl PostFields {
    /// Single validation pass. Every missing required field is reported at
    /// once; blank optional values collapse to `None`.
    pub fn validate(self) -> Result<NewPost, ValidationError> {
        let mut missing = Vec::new();
        let mut required = |name: &'static str, v: Option<String>| {
            let v = clean(v);
            if v.is_none() {
                missing.push(name);
            }
            v.unwrap_or_default()
        };
        let pet_name = required("pet_name", self.pet_name);
        let description = required("description", self.description);
        let breed = required("breed", self.breed);
        let color = required("color", self.color);
        let neighborhood = required("neighborhood", self.neighborhood);
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }

        let whatsapp = clean(self.whatsapp);
        let instagram = clean(self.instagram);
        if whatsapp.is_none() && instagram.is_none() {
            return Err(ValidationError::NoContact);
        }

        let pet_age = match clean(self.pet_age) {
            Some(raw) => match raw.parse::<i32>() {
                Ok(age) if age >= 0 => Some(age),
                _ => return Err(ValidationError::InvalidAge),
            },
            None => None,
        };

        Ok(NewPost {
            pet_name,
            description,
            breed,
            color,
            neighborhood,
            accessory: clean(self.accessory),
            location_reference: clean(self.location_reference),
            whatsapp,
            instagram,
            pet_age,
            address: clean(self.address),
        })
    }
}

/// One uploaded photo, in the order the client supplied it.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self { file_name: None, bytes: bytes.into() }
    }

    pub fn mime(&self) -> String {
        infer::get(&self.bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into())
    }
}

/// Equality predicates over the browseable columns, combined with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams, PartialEq, Eq)]
#[into_params(parameter_in = Query)]
pub struct PostFilter {
    pub breed: Option<String>,
    pub neighborhood: Option<String>,
    pub color: Option<String>,
}

impl PostFilter {
    /// Drops blank predicates (an empty filter input means "any").
    pub fn normalized(self) -> Self {
        Self {
            breed: clean(self.breed),
            neighborhood: clean(self.neighborhood),
            color: clean(self.color),
        }
    }

    pub fn matches(&self, post: &Post) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&self.breed, &post.breed)
            && eq(&self.neighborhood, &post.neighborhood)
            && eq(&self.color, &post.color)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct CreatedPost {
    pub id: Id,
    pub images: Vec<String>, // locators in submission order
}
