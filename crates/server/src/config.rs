use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Base url clients reach this server under; baked into grant urls.
    pub public_base_url: String,
    pub blob_root: String,
    pub grant_secret: String,
    pub upload_grant_ttl_seconds: i64,
    pub download_grant_ttl_seconds: i64,
    pub seed_demo_users: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/messaging.db".into(),
            public_base_url: "http://127.0.0.1:8443".into(),
            blob_root: "./data/blobs".into(),
            grant_secret: "dev-blob-secret".into(),
            upload_grant_ttl_seconds: 300,
            download_grant_ttl_seconds: 60,
            seed_demo_users: false,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("public_base_url") {
                settings.public_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("blob_root") {
                settings.blob_root = v.clone();
            }
            if let Some(v) = file_cfg.get("grant_secret") {
                settings.grant_secret = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("PUBLIC_BASE_URL") {
        settings.public_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__PUBLIC_BASE_URL") {
        settings.public_base_url = v;
    }

    if let Ok(v) = std::env::var("BLOB_ROOT") {
        settings.blob_root = v;
    }
    if let Ok(v) = std::env::var("APP__BLOB_ROOT") {
        settings.blob_root = v;
    }

    if let Ok(v) = std::env::var("GRANT_SECRET") {
        settings.grant_secret = v;
    }
    if let Ok(v) = std::env::var("APP__GRANT_SECRET") {
        settings.grant_secret = v;
    }

    if let Ok(v) = std::env::var("APP__UPLOAD_GRANT_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.upload_grant_ttl_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__DOWNLOAD_GRANT_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.download_grant_ttl_seconds = parsed;
        }
    }

    if let Ok(v) = std::env::var("APP__SEED_DEMO_USERS") {
        settings.seed_demo_users = matches!(v.trim(), "1" | "true" | "yes");
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn creates_parent_dir_for_relative_sqlite_url() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();

        let temp_root = env::temp_dir().join(format!("care_msg_server_test_{suffix}"));
        fs::create_dir_all(&temp_root).expect("temp root");

        let original_dir = env::current_dir().expect("cwd");
        env::set_current_dir(&temp_root).expect("set cwd");

        prepare_database_url("./data/test.db").expect("prepare db url");
        assert!(temp_root.join("data").exists());

        env::set_current_dir(original_dir).expect("restore cwd");
        fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
