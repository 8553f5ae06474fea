//! Boundary to the remote registry service.
//!
//! The core issues create/read/delete calls through [`RegistrySession`] and
//! never retries, caches or inspects credentials itself; transport, timeouts
//! and retry policy belong to the implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::models::RegistryId;

/// Request headers, in the order they should be sent.
pub type Headers = Vec<(String, String)>;

/// Produces auth headers for each call.
pub type AuthProvider = Box<dyn Fn() -> Headers + Send + Sync>;

/// `Authorization: Bearer <token>` provider.
pub fn bearer(token: impl Into<String>) -> AuthProvider {
    let value = format!("Bearer {}", token.into());
    Box::new(move || vec![("Authorization".to_string(), value.clone())])
}

/// Response to a create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub guid: RegistryId,
    #[serde(default)]
    pub attributes: Value,
}

pub trait RegistrySession {
    fn create_entity(
        &mut self,
        path: &[&str],
        body: &Value,
        headers: &Headers,
    ) -> Result<CreatedEntity, TransportError>;

    fn read_entity(&self, path: &[&str], headers: &Headers) -> Result<Value, TransportError>;

    fn delete_entity(&mut self, path: &[&str], headers: &Headers) -> Result<Value, TransportError>;
}

impl<S: RegistrySession + ?Sized> RegistrySession for &mut S {
    fn create_entity(
        &mut self,
        path: &[&str],
        body: &Value,
        headers: &Headers,
    ) -> Result<CreatedEntity, TransportError> {
        (**self).create_entity(path, body, headers)
    }

    fn read_entity(&self, path: &[&str], headers: &Headers) -> Result<Value, TransportError> {
        (**self).read_entity(path, headers)
    }

    fn delete_entity(&mut self, path: &[&str], headers: &Headers) -> Result<Value, TransportError> {
        (**self).delete_entity(path, headers)
    }
}
