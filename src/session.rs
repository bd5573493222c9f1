//! Explicit authenticated session.
//!
//! The backend issues a bearer token at login. Rather than stashing it in
//! ambient global state, callers hold a [`Session`] and hand it to the
//! [`ApiClient`](crate::api::ApiClient); dropping it is logout.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
}

impl Session {
    /// Authenticate against the backend and return a live session.
    pub async fn login(
        http: &reqwest::Client,
        base_url: &str,
        email: &str,
        password: &str,
    ) -> Result<Self> {
        let url = format!("{}/auth/login", base_url.trim_end_matches('/'));
        let response = http
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .context("Login request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("Login rejected with status {}", response.status()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse login response")?;

        Ok(Self {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_at: None,
        })
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now(),
            None => false,
        }
    }

    /// `Authorization` header value for authenticated requests.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    fn session_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
        path.push("rotation");
        fs::create_dir_all(&path)?;
        path.push(SESSION_FILE_NAME);
        Ok(path)
    }

    /// Load a previously saved session, if one exists.
    pub fn load() -> Result<Option<Self>> {
        Self::load_from(&Self::session_path()?)
    }

    fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path).context("Failed to read session file")?;
        let session: Session =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    /// Persist the session so the console can reuse it across runs.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::session_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).context("Failed to write session file")?;
        Ok(())
    }

    /// Remove any persisted session. Explicit logout.
    pub fn clear_saved() -> Result<()> {
        let path = Self::session_path()?;
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}
