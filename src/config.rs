use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;

use crate::credential::HashCost;
use crate::lifecycle::{AttachmentLimits, CleanupPolicy};
use crate::rate_limit::RateLimitConfig;
use crate::routes::UPLOADS_ROUTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    Fs,
    S3,
}

/// S3 / MinIO connection settings; present only when `BLOB_BACKEND=s3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Base that browsers fetch objects from; locators are `{public_url}/{key}`.
    pub public_url: String,
}

impl S3Config {
    fn from_env() -> anyhow::Result<Self> {
        let endpoint = var("S3_ENDPOINT")
            .ok_or_else(|| anyhow!("S3_ENDPOINT must be set when BLOB_BACKEND=s3 (MinIO / S3 endpoint)"))?;
        let bucket = var("S3_BUCKET").unwrap_or_else(|| "lostpet-images".into());
        // default to path-style URLs on the endpoint
        let public_url = var("S3_PUBLIC_URL")
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket))
            .trim_end_matches('/')
            .to_string();
        let access_key = var("S3_ACCESS_KEY");
        let secret_key = var("S3_SECRET_KEY");
        if access_key.is_some() != secret_key.is_some() {
            return Err(anyhow!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together"));
        }
        Ok(Self {
            bucket,
            endpoint,
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            access_key,
            secret_key,
            public_url,
        })
    }
}

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    /// Server-side bound on a transaction left open by an abandoned request.
    pub db_idle_tx_timeout: Duration,
    pub blob_backend: BlobBackend,
    pub s3: Option<S3Config>,
    pub upload_dir: PathBuf,
    pub upload_url_prefix: String,
    pub frontend_url: Option<String>,
    /// Snapshot directory of the in-memory repository (no `DATABASE_URL`).
    pub data_dir: PathBuf,
    pub limits: AttachmentLimits,
    pub cleanup: CleanupPolicy,
    pub hash_cost: HashCost,
    pub rate_limit_enabled: bool,
    pub rate_limits: RateLimitConfig,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e| anyhow!("{name}={raw:?}: {e}")),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let blob_backend = match var("BLOB_BACKEND").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("fs") => BlobBackend::Fs,
            Some("s3") => BlobBackend::S3,
            Some(other) => return Err(anyhow!("BLOB_BACKEND must be 'fs' or 's3', got {other:?}")),
        };
        let s3 = match blob_backend {
            BlobBackend::S3 => Some(S3Config::from_env()?),
            BlobBackend::Fs => None,
        };
        let defaults = HashCost::default();
        let rl = RateLimitConfig::default();
        let cfg = Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("PORT", 3000)?,
            database_url: var("DATABASE_URL"),
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 5)?,
            db_acquire_timeout: Duration::from_secs(parsed("DB_ACQUIRE_TIMEOUT_SECS", 5)?),
            db_idle_tx_timeout: Duration::from_secs(parsed("DB_IDLE_TX_TIMEOUT_SECS", 30)?),
            blob_backend,
            s3,
            upload_dir: var("UPLOAD_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("public/uploads")),
            upload_url_prefix: var("UPLOAD_URL_PREFIX").unwrap_or_else(|| "/uploads".into()),
            frontend_url: var("FRONTEND_URL"),
            data_dir: var("LOSTPET_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data")),
            limits: AttachmentLimits {
                max_attachments: parsed("MAX_ATTACHMENTS", AttachmentLimits::default().max_attachments)?,
                max_bytes: parsed("MAX_ATTACHMENT_BYTES", AttachmentLimits::default().max_bytes)?,
            },
            cleanup: CleanupPolicy { max_retries: parsed("CLEANUP_MAX_RETRIES", 0)? },
            hash_cost: HashCost {
                memory_kib: parsed("ARGON2_MEMORY_KIB", defaults.memory_kib)?,
                iterations: parsed("ARGON2_ITERATIONS", defaults.iterations)?,
                parallelism: defaults.parallelism,
            },
            rate_limit_enabled: parsed("RL_ENABLED", true)?,
            rate_limits: RateLimitConfig {
                create_limit: parsed("RL_CREATE_LIMIT", rl.create_limit)?,
                create_window: Duration::from_secs(parsed("RL_CREATE_WINDOW", rl.create_window.as_secs())?),
                delete_limit: parsed("RL_DELETE_LIMIT", rl.delete_limit)?,
                delete_window: Duration::from_secs(parsed("RL_DELETE_WINDOW", rl.delete_window.as_secs())?),
            },
        };
        if !cfg.upload_url_prefix.starts_with('/') && !cfg.upload_url_prefix.starts_with("http") {
            return Err(anyhow!("UPLOAD_URL_PREFIX must be an absolute path or URL, got {:?}", cfg.upload_url_prefix));
        }
        // The disk store is served by the `/uploads` route, so its locators must land there.
        if cfg.blob_backend == BlobBackend::Fs && !cfg.upload_url_prefix.trim_end_matches('/').ends_with(UPLOADS_ROUTE) {
            return Err(anyhow!(
                "UPLOAD_URL_PREFIX must end with {UPLOADS_ROUTE} for the fs backend, got {:?}",
                cfg.upload_url_prefix
            ));
        }
        if cfg.limits.max_attachments == 0 {
            return Err(anyhow!("MAX_ATTACHMENTS must be at least 1"));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "BLOB_BACKEND", "PORT", "MAX_ATTACHMENTS", "UPLOAD_URL_PREFIX", "DATABASE_URL", "LOSTPET_DATA_DIR",
        "S3_ENDPOINT", "S3_BUCKET", "S3_PUBLIC_URL", "S3_ACCESS_KEY", "S3_SECRET_KEY",
        "RL_CREATE_LIMIT", "RL_CREATE_WINDOW", "RL_DELETE_LIMIT", "RL_DELETE_WINDOW",
    ];

    fn clear_env() {
        for k in KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    #[serial_test::serial]
    fn defaults_and_overrides() {
        clear_env();
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.blob_backend, BlobBackend::Fs);
        assert!(cfg.s3.is_none());
        assert_eq!(cfg.upload_url_prefix, "/uploads");
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert_eq!(cfg.cleanup.max_retries, 0);
        assert_eq!(cfg.rate_limits.delete_limit, 10);
        assert!(cfg.database_url.is_none());

        std::env::set_var("PORT", "8081");
        std::env::set_var("LOSTPET_DATA_DIR", "/var/lib/lostpet");
        std::env::set_var("RL_DELETE_LIMIT", "3");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/lostpet"));
        assert_eq!(cfg.rate_limits.delete_limit, 3);

        std::env::set_var("PORT", "not-a-port");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("PORT");

        std::env::set_var("BLOB_BACKEND", "ftp");
        assert!(AppConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn malformed_rate_limits_abort() {
        clear_env();
        for key in ["RL_CREATE_LIMIT", "RL_CREATE_WINDOW", "RL_DELETE_LIMIT", "RL_DELETE_WINDOW"] {
            std::env::set_var(key, "abc");
            let err = AppConfig::from_env().unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
            std::env::remove_var(key);
        }
        std::env::set_var("RL_CREATE_WINDOW", "120");
        assert_eq!(AppConfig::from_env().unwrap().rate_limits.create_window, Duration::from_secs(120));
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn s3_backend_needs_endpoint() {
        clear_env();
        std::env::set_var("BLOB_BACKEND", "S3");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("S3_ENDPOINT"), "{err}");

        std::env::set_var("S3_ENDPOINT", "http://minio:9000/");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.blob_backend, BlobBackend::S3);
        let s3 = cfg.s3.unwrap();
        assert_eq!(s3.bucket, "lostpet-images");
        assert_eq!(s3.public_url, "http://minio:9000/lostpet-images");

        std::env::set_var("S3_ACCESS_KEY", "minio");
        assert!(AppConfig::from_env().is_err(), "half a credential pair is rejected");
        std::env::set_var("S3_SECRET_KEY", "minio123");
        assert_eq!(AppConfig::from_env().unwrap().s3.unwrap().access_key.as_deref(), Some("minio"));
        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn fs_prefix_must_reach_uploads_route() {
        clear_env();
        std::env::set_var("UPLOAD_URL_PREFIX", "/media");
        assert!(AppConfig::from_env().is_err());
        std::env::set_var("UPLOAD_URL_PREFIX", "https://pets.example.com/uploads/");
        assert!(AppConfig::from_env().is_ok());
        // S3 locators never go through the route
        std::env::set_var("BLOB_BACKEND", "s3");
        std::env::set_var("S3_ENDPOINT", "http://minio:9000");
        std::env::set_var("UPLOAD_URL_PREFIX", "/media");
        assert!(AppConfig::from_env().is_ok());
        clear_env();
    }
}
