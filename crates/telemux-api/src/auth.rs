// Session auth wire types for the server's JWT endpoints.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

#[allow(clippy::ref_option_ref, clippy::trivially_copy_pass_by_ref)]
fn expose<S: Serializer>(secret: &&SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// `POST /api/auth/login` body.
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    #[serde(serialize_with = "expose")]
    pub password: &'a SecretString,
}

/// `POST /api/auth/token` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    #[serde(serialize_with = "expose")]
    pub refresh_token: &'a SecretString,
}

/// Access/refresh token pair returned by both auth endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtPair {
    pub token: SecretString,
    pub refresh_token: SecretString,
}
