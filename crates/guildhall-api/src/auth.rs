use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use guildhall_db::Database;
use guildhall_engine::Engines;
use guildhall_types::Address;
use guildhall_types::api::Claims;
use guildhall_types::models::User;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub engines: Arc<Engines>,
    pub jwt_secret: String,
    /// Interface used for a user's personal notifications.
    pub contact_interface: String,
}

/// Issue a bearer token. Used by operators and tests; the server itself
/// never mints tokens.
pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    roles: &[&str],
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (Utc::now() + ttl).timestamp().max(0) as usize;
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

/// The user a token describes. Roles and handle come from the token.
pub fn user_from_claims(claims: &Claims, contact_interface: &str) -> User {
    User {
        id: claims.sub,
        handle: claims.username.clone(),
        roles: claims.roles.iter().cloned().collect(),
        contact: Some(Address::user(contact_interface, claims.sub)),
    }
}
