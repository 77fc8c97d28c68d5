//! Authentication and authorization seam.
//!
//! The broker consumes three opaque decision callbacks: `authenticate` gates
//! CONNECT, `authorize_publish` gates PUBLISH, `authorize_subscribe` gates
//! each SUBSCRIBE filter. Each returns `Ok(false)` for a denial and `Err` for
//! a handler failure; the session treats the two differently on CONNECT
//! (CONNACK 5 vs. bare transport end) and identically elsewhere (close).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth handler failure: {0}")]
    Handler(String),
}

#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, AuthError>;

    async fn authorize_publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<bool, AuthError>;

    async fn authorize_subscribe(&self, client_id: &str, filter: &str) -> Result<bool, AuthError>;
}

/// Default handler: everything is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthHandler for AllowAll {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: &[u8],
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize_subscribe(
        &self,
        _client_id: &str,
        _filter: &str,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}

/// Username/password table for simple deployments and tests. Authenticated
/// clients are authorized for every topic.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: RwLock<HashMap<String, Vec<u8>>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str, password: &[u8]) {
        self.users
            .write()
            .insert(username.to_string(), password.to_vec());
    }
}

#[async_trait]
impl AuthHandler for StaticCredentials {
    async fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        let Some(username) = username else {
            return Ok(false);
        };
        let users = self.users.read();
        match users.get(username) {
            Some(stored) => Ok(password == Some(stored.as_slice())),
            None => Ok(false),
        }
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        _topic: &str,
        _payload: &[u8],
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize_subscribe(
        &self,
        _client_id: &str,
        _filter: &str,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}
