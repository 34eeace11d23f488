use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("storage unavailable: {0}")] Unavailable(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Relational side of a post: the post row plus its image locator rows.
/// Every mutating operation is atomic.
#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn ping(&self) -> RepoResult<()>;
    /// Opens a write transaction for creating one post with its images.
    async fn begin(&self) -> RepoResult<Box<dyn PostTx>>;
    /// Newest first; images in insertion order.
    async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Vec<Post>>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn credential_hash(&self, id: Id) -> RepoResult<String>;
    /// Removes the image rows and the post row in one transaction and returns
    /// the locators that were referenced. `NotFound` if the post is already gone.
    async fn delete_post(&self, id: Id) -> RepoResult<Vec<String>>;
}

/// An open creation transaction. Nothing is visible to readers before
/// `commit`; dropping it without committing discards every staged row.
#[async_trait]
pub trait PostTx: Send {
    async fn insert_post(&mut self, new: &NewPost, credential_hash: &str) -> RepoResult<Id>;
    async fn insert_image(&mut self, post_id: Id, locator: &str) -> RepoResult<Id>;
    async fn commit(self: Box<Self>) -> RepoResult<()>;
    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::{DateTime, Utc};
    use log::{info, warn};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

    #[derive(Clone, Serialize, Deserialize)]
    struct StoredPost {
        id: Id,
        fields: NewPost,
        credential_hash: String,
        created_at: DateTime<Utc>,
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct StoredImage {
        id: Id,
        post_id: Id,
        locator: String,
    }

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        posts: BTreeMap<Id, StoredPost>,
        images: BTreeMap<Id, StoredImage>,
        next_id: Id,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn view(&self, p: &StoredPost) -> Post {
            let images = self
                .images
                .values()
                .filter(|i| i.post_id == p.id)
                .map(|i| PostImage { id: i.id, url: i.locator.clone() })
                .collect();
            let f = &p.fields;
            Post {
                id: p.id,
                pet_name: f.pet_name.clone(),
                description: f.description.clone(),
                breed: f.breed.clone(),
                color: f.color.clone(),
                neighborhood: f.neighborhood.clone(),
                accessory: f.accessory.clone(),
                location_reference: f.location_reference.clone(),
                whatsapp: f.whatsapp.clone(),
                instagram: f.instagram.clone(),
                pet_age: f.pet_age,
                address: f.address.clone(),
                created_at: p.created_at,
                images,
            }
        }
    }

    /// Process-local repository; optionally snapshotted to a JSON file so a
    /// dev server keeps its posts across restarts.
    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
    }

    impl InMemRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let state = Self::load_state_from(&path);
            Self { state: Arc::new(RwLock::new(state)), snapshot_path: Some(Arc::new(path)) }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!("[inmem] Loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        warn!("[inmem] Failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                        State::default()
                    }
                },
                Err(e) => {
                    info!("[inmem] No snapshot at '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            }
        }

        fn read(&self) -> RwLockReadGuard<'_, State> {
            self.state.read().unwrap_or_else(|e| e.into_inner())
        }

        fn write(&self) -> RwLockWriteGuard<'_, State> {
            self.state.write().unwrap_or_else(|e| e.into_inner())
        }

        /// Writes `state` to the snapshot file. Callers hold the write guard
        /// so snapshots land in commit order; the temp file + rename keeps the
        /// previous snapshot intact if the process dies mid-write.
        fn persist(&self, state: &State) {
            let Some(path) = self.snapshot_path.as_deref() else { return };
            let bytes = match serde_json::to_vec_pretty(state) {
                Ok(b) => b,
                Err(e) => {
                    warn!("[inmem] Failed to serialise snapshot: {e}");
                    return;
                }
            };
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            let tmp = path.with_extension("json.tmp");
            if let Err(e) = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path)) {
                warn!("[inmem] Failed to write snapshot '{}': {e}", path.display());
            }
        }
    }

    pub struct InMemTx {
        repo: InMemRepo,
        post: Option<StoredPost>,
        images: Vec<StoredImage>,
    }

    #[async_trait]
    impl PostTx for InMemTx {
        async fn insert_post(&mut self, new: &NewPost, credential_hash: &str) -> RepoResult<Id> {
            if self.post.is_some() {
                return Err(RepoError::Conflict);
            }
            let id = self.repo.write().next_id();
            self.post = Some(StoredPost {
                id,
                fields: new.clone(),
                credential_hash: credential_hash.to_string(),
                created_at: Utc::now(),
            });
            Ok(id)
        }

        async fn insert_image(&mut self, post_id: Id, locator: &str) -> RepoResult<Id> {
            if self.post.as_ref().map(|p| p.id) != Some(post_id) {
                return Err(RepoError::NotFound);
            }
            let mut s = self.repo.write();
            let taken = s.images.values().any(|i| i.locator == locator)
                || self.images.iter().any(|i| i.locator == locator);
            if taken {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            drop(s);
            self.images.push(StoredImage { id, post_id, locator: locator.to_string() });
            Ok(id)
        }

        async fn commit(self: Box<Self>) -> RepoResult<()> {
            let InMemTx { repo, post, images } = *self;
            let mut s = repo.write();
            if let Some(post) = post {
                s.posts.insert(post.id, post);
            }
            for img in images {
                s.images.insert(img.id, img);
            }
            repo.persist(&s);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> RepoResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn ping(&self) -> RepoResult<()> {
            Ok(())
        }

        async fn begin(&self) -> RepoResult<Box<dyn PostTx>> {
            Ok(Box::new(InMemTx { repo: self.clone(), post: None, images: Vec::new() }))
        }

        async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Vec<Post>> {
            let s = self.read();
            let mut v: Vec<Post> = s
                .posts
                .values()
                .map(|p| s.view(p))
                .filter(|p| filter.matches(p))
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.read();
            s.posts.get(&id).map(|p| s.view(p)).ok_or(RepoError::NotFound)
        }

        async fn credential_hash(&self, id: Id) -> RepoResult<String> {
            self.read()
                .posts
                .get(&id)
                .map(|p| p.credential_hash.clone())
                .ok_or(RepoError::NotFound)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<Vec<String>> {
            let mut s = self.write();
            if s.posts.remove(&id).is_none() {
                return Err(RepoError::NotFound);
            }
            let owned: Vec<Id> = s.images.values().filter(|i| i.post_id == id).map(|i| i.id).collect();
            let locators = owned
                .into_iter()
                .filter_map(|img_id| s.images.remove(&img_id))
                .map(|i| i.locator)
                .collect::<Vec<_>>();
            self.persist(&s);
            Ok(locators)
        }
    }
}

#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::time::Duration;

    const POST_COLUMNS: &str = "id, pet_name, description, breed, color, neighborhood, accessory, \
        location_reference, whatsapp, instagram, pet_age, address, created_at";

    fn db_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(ref d) if d.code().as_deref() == Some("23505") => RepoError::Conflict,
            other => RepoError::Unavailable(other.to_string()),
        }
    }

    #[derive(sqlx::FromRow)]
    struct PostRow {
        id: Id,
        pet_name: String,
        description: String,
        breed: String,
        color: String,
        neighborhood: String,
        accessory: Option<String>,
        location_reference: Option<String>,
        whatsapp: Option<String>,
        instagram: Option<String>,
        pet_age: Option<i32>,
        address: Option<String>,
        created_at: DateTime<Utc>,
    }

    impl PostRow {
        fn into_post(self, images: Vec<PostImage>) -> Post {
            Post {
                id: self.id,
                pet_name: self.pet_name,
                description: self.description,
                breed: self.breed,
                color: self.color,
                neighborhood: self.neighborhood,
                accessory: self.accessory,
                location_reference: self.location_reference,
                whatsapp: self.whatsapp,
                instagram: self.instagram,
                pet_age: self.pet_age,
                address: self.address,
                created_at: self.created_at,
                images,
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct ImageRow {
        id: Id,
        post_id: Id,
        locator: String,
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: PgPool }

    impl PgRepo {
        pub fn new(pool: PgPool) -> Self { Self { pool } }

        /// Lazily connected pool. Every connection carries an
        /// `idle_in_transaction_session_timeout`, so a transaction abandoned by
        /// a cancelled request is rolled back by the server.
        pub fn connect_lazy(
            url: &str,
            max_connections: u32,
            acquire_timeout: Duration,
            idle_tx_timeout: Duration,
        ) -> Result<Self, sqlx::Error> {
            let opts = PgConnectOptions::from_str(url)?
                .options([("idle_in_transaction_session_timeout", idle_tx_timeout.as_millis().to_string())]);
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .connect_lazy_with(opts);
            Ok(Self::new(pool))
        }

        pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
            sqlx::migrate!("./migrations").run(&self.pool).await
        }

        async fn with_images(
            tx: &mut Transaction<'static, Postgres>,
            rows: Vec<PostRow>,
        ) -> RepoResult<Vec<Post>> {
            let ids: Vec<Id> = rows.iter().map(|r| r.id).collect();
            let images = sqlx::query_as::<_, ImageRow>(
                "SELECT id, post_id, locator FROM post_images WHERE post_id = ANY($1) ORDER BY id",
            )
            .bind(&ids[..])
            .fetch_all(&mut **tx)
            .await
            .map_err(db_err)?;
            let mut by_post: HashMap<Id, Vec<PostImage>> = HashMap::new();
            for img in images {
                by_post.entry(img.post_id).or_default().push(PostImage { id: img.id, url: img.locator });
            }
            Ok(rows
                .into_iter()
                .map(|r| {
                    let imgs = by_post.remove(&r.id).unwrap_or_default();
                    r.into_post(imgs)
                })
                .collect())
        }

        /// Posts and their images are read from one snapshot so a concurrent
        /// delete can never surface as a post with a partial image set.
        async fn snapshot(&self) -> RepoResult<Transaction<'static, Postgres>> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            Ok(tx)
        }
    }

    pub struct PgTx { tx: Transaction<'static, Postgres> }

    #[async_trait]
    impl PostTx for PgTx {
        async fn insert_post(&mut self, new: &NewPost, credential_hash: &str) -> RepoResult<Id> {
            sqlx::query_scalar::<_, Id>(
                "INSERT INTO lost_pet_posts (
                    pet_name, description, breed, color, neighborhood,
                    accessory, location_reference, whatsapp, instagram,
                    pet_age, address, credential_hash
                 ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                 RETURNING id",
            )
            .bind(&new.pet_name)
            .bind(&new.description)
            .bind(&new.breed)
            .bind(&new.color)
            .bind(&new.neighborhood)
            .bind(&new.accessory)
            .bind(&new.location_reference)
            .bind(&new.whatsapp)
            .bind(&new.instagram)
            .bind(new.pet_age)
            .bind(&new.address)
            .bind(credential_hash)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)
        }

        async fn insert_image(&mut self, post_id: Id, locator: &str) -> RepoResult<Id> {
            sqlx::query_scalar::<_, Id>("INSERT INTO post_images (post_id, locator) VALUES ($1,$2) RETURNING id")
                .bind(post_id)
                .bind(locator)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(db_err)
        }

        async fn commit(self: Box<Self>) -> RepoResult<()> {
            self.tx.commit().await.map_err(db_err)
        }

        async fn rollback(self: Box<Self>) -> RepoResult<()> {
            self.tx.rollback().await.map_err(db_err)
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn ping(&self) -> RepoResult<()> {
            sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
            Ok(())
        }

        async fn begin(&self) -> RepoResult<Box<dyn PostTx>> {
            let tx = self.pool.begin().await.map_err(db_err)?;
            Ok(Box::new(PgTx { tx }))
        }

        async fn list_posts(&self, filter: &PostFilter) -> RepoResult<Vec<Post>> {
            let mut tx = self.snapshot().await?;
            let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {POST_COLUMNS} FROM lost_pet_posts WHERE TRUE"));
            if let Some(breed) = &filter.breed {
                qb.push(" AND breed = ").push_bind(breed.clone());
            }
            if let Some(neighborhood) = &filter.neighborhood {
                qb.push(" AND neighborhood = ").push_bind(neighborhood.clone());
            }
            if let Some(color) = &filter.color {
                qb.push(" AND color = ").push_bind(color.clone());
            }
            qb.push(" ORDER BY created_at DESC, id DESC");
            let rows = qb.build_query_as::<PostRow>().fetch_all(&mut *tx).await.map_err(db_err)?;
            let posts = Self::with_images(&mut tx, rows).await?;
            tx.commit().await.map_err(db_err)?;
            Ok(posts)
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let mut tx = self.snapshot().await?;
            let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {POST_COLUMNS} FROM lost_pet_posts WHERE id = $1"))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or(RepoError::NotFound)?;
            let post = Self::with_images(&mut tx, vec![row]).await?.pop().ok_or(RepoError::NotFound)?;
            tx.commit().await.map_err(db_err)?;
            Ok(post)
        }

        async fn credential_hash(&self, id: Id) -> RepoResult<String> {
            sqlx::query_scalar::<_, String>("SELECT credential_hash FROM lost_pet_posts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or(RepoError::NotFound)
        }

        async fn delete_post(&self, id: Id) -> RepoResult<Vec<String>> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            // Row lock serialises concurrent deletes of the same post; the loser
            // sees no row once the winner commits.
            let locked = sqlx::query_scalar::<_, Id>("SELECT id FROM lost_pet_posts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if locked.is_none() {
                return Err(RepoError::NotFound);
            }
            let locators = sqlx::query_scalar::<_, String>("SELECT locator FROM post_images WHERE post_id = $1 ORDER BY id")
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM post_images WHERE post_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            let deleted = sqlx::query("DELETE FROM lost_pet_posts WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            if deleted.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            tx.commit().await.map_err(db_err)?;
            Ok(locators)
        }
    }
}
