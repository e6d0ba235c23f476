//! Bearer credential to caller identity.
//!
//! Tokens are HS256 JWTs naming the user. The resolver looks the user up in
//! the `users` collection and expands its role closure breadth-first, one
//! level of role-in-role membership per step, up to the configured depth.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Identity, RoleRef, collections, types};
use crate::store::{DocumentStore, Filter, Query};

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `None` when the credential is invalid, expired or names nobody.
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>>;

    /// Sign a credential for `identity`, valid for `ttl`.
    fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtIdentityResolver {
    encoding: EncodingKey,
    decoding: DecodingKey,
    store: Arc<dyn DocumentStore>,
    max_role_depth: usize,
}

impl JwtIdentityResolver {
    pub fn new(signing_key: &SecretString, store: Arc<dyn DocumentStore>, max_role_depth: usize) -> Self {
        let secret = signing_key.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            store,
            max_role_depth,
        }
    }

    fn verify(&self, credential: &str) -> Option<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        match decode::<Claims>(credential, &self.decoding, &validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "credential rejected");
                None
            }
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<Option<Identity>> {
        let Some(claims) = self.verify(credential) else {
            return Ok(None);
        };

        let root = Identity::root();
        let stored = self
            .store
            .get_by_id(collections::USERS, &claims.sub, &root)
            .await?;
        if let Some(doc) = &stored {
            if doc.get("disabled").and_then(Value::as_bool) == Some(true) {
                tracing::info!(user = %claims.username, "credential for disabled user");
                return Ok(None);
            }
        }

        let mut identity = match stored {
            Some(doc) => Identity::new(
                claims.sub.clone(),
                str_field(&doc, "name").unwrap_or(claims.name.as_str()),
                str_field(&doc, "username").unwrap_or(claims.username.as_str()),
            ),
            None => Identity::new(claims.sub.clone(), claims.name, claims.username),
        };
        if identity.is_root() {
            return Ok(Some(identity));
        }

        for role in role_closure(self.store.as_ref(), &identity.id, self.max_role_depth).await? {
            identity.add_role(role);
        }
        Ok(Some(identity))
    }

    fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: identity.id.clone(),
            name: identity.name.clone(),
            username: identity.username.clone(),
            iat: now,
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Other(format!("failed to sign credential: {e}")))
    }
}

fn str_field<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Roles `member_id` belongs to, directly or through up to `max_depth`
/// levels of nesting.
pub async fn role_closure(
    store: &dyn DocumentStore,
    member_id: &str,
    max_depth: usize,
) -> Result<Vec<RoleRef>> {
    let root = Identity::root();
    let mut seen: HashSet<String> = HashSet::from([member_id.to_string()]);
    let mut closure = Vec::new();
    let mut frontier = vec![member_id.to_string()];

    for _ in 0..max_depth.max(1) {
        let mut next = Vec::new();
        for member in &frontier {
            let query = Query::new(
                Filter::eq("_type", types::ROLE).and(Filter::eq("members._id", member.as_str())),
            );
            for role in store.query(collections::USERS, &query, &root).await? {
                let Some(id) = str_field(&role, "_id") else {
                    continue;
                };
                if seen.insert(id.to_string()) {
                    closure.push(RoleRef {
                        id: id.to_string(),
                        name: str_field(&role, "name").unwrap_or_default().to_string(),
                    });
                    next.push(id.to_string());
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use serde_json::json;

    async fn seed_roles(store: &MemoryDocumentStore) {
        let root = Identity::root();
        for doc in [
            json!({"_id": "r1", "_type": "role", "name": "ops", "members": [{"_id": "u1"}]}),
            json!({"_id": "r2", "_type": "role", "name": "staff", "members": [{"_id": "r1"}]}),
            json!({"_id": "r3", "_type": "role", "name": "everyone", "members": [{"_id": "r2"}]}),
        ] {
            store.insert_one(collections::USERS, doc, &root).await.unwrap();
        }
    }

    #[tokio::test]
    async fn closure_stops_at_depth() {
        let store = MemoryDocumentStore::new();
        seed_roles(&store).await;

        let depth_two = role_closure(&store, "u1", 2).await.unwrap();
        let ids: Vec<&str> = depth_two.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        let depth_three = role_closure(&store, "u1", 3).await.unwrap();
        assert_eq!(depth_three.len(), 3);
    }

    #[tokio::test]
    async fn issued_tokens_resolve_with_roles() {
        let store = Arc::new(MemoryDocumentStore::new());
        seed_roles(&store).await;
        let resolver =
            JwtIdentityResolver::new(&SecretString::from("test-key"), store.clone(), 2);

        let token = resolver
            .issue(&Identity::new("u1", "Ann", "ann"), Duration::from_secs(60))
            .unwrap();
        let identity = resolver.resolve(&token).await.unwrap().unwrap();
        assert_eq!(identity.username, "ann");
        assert!(identity.has_role("r1"));
        assert!(identity.has_role("r2"));
    }

    #[tokio::test]
    async fn garbage_tokens_resolve_to_none() {
        let store = Arc::new(MemoryDocumentStore::new());
        let resolver = JwtIdentityResolver::new(&SecretString::from("test-key"), store, 2);
        assert!(resolver.resolve("not-a-jwt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_signed_with_another_key_are_rejected() {
        let store = Arc::new(MemoryDocumentStore::new());
        let issuer = JwtIdentityResolver::new(&SecretString::from("key-a"), store.clone(), 2);
        let verifier = JwtIdentityResolver::new(&SecretString::from("key-b"), store, 2);
        let token = issuer
            .issue(&Identity::new("u1", "Ann", "ann"), Duration::from_secs(60))
            .unwrap();
        assert!(verifier.resolve(&token).await.unwrap().is_none());
    }
}
