//! Token endpoint calls: refresh and authorization-code exchange.
//!
//! Both POST `application/x-www-form-urlencoded` bodies to
//! [`OAuthConfig::token_url`]. A non-success status is returned as
//! [`AuthError::OAuth`] so callers can classify it with
//! [`AuthError::is_unrecoverable`].

use reqwest::Url;

use crate::errors::AuthError;
use crate::types::{OAuthConfig, TokenResponse};

/// Refresh an access token.
#[tracing::instrument(skip_all, fields(token_url = %config.token_url))]
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &OAuthConfig,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse, AuthError> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    post_form(client, &config.token_url, &form).await
}

/// Exchange an authorization code (with its PKCE verifier) for tokens.
#[tracing::instrument(skip_all, fields(token_url = %config.token_url))]
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &OAuthConfig,
    client_id: &str,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse, AuthError> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", verifier),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
    ];
    post_form(client, &config.token_url, &form).await
}

/// Authorization URL for the code flow with an S256 challenge.
pub fn authorization_url(
    config: &OAuthConfig,
    client_id: &str,
    challenge: &str,
    state: &str,
) -> Result<Url, AuthError> {
    let mut url = Url::parse(&config.authorize_url)
        .map_err(|e| AuthError::Config(format!("authorize url {}: {e}", config.authorize_url)))?;
    {
        let mut query = url.query_pairs_mut();
        let _ = query
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        if !config.scopes.is_empty() {
            let _ = query.append_pair("scope", &config.scopes.join(" "));
        }
    }
    Ok(url)
}

async fn post_form(
    client: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    let resp = client.post(url).form(form).send().await?;

    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(AuthError::OAuth {
            status: status.as_u16(),
            message,
        });
    }

    let body = resp.text().await?;
    Ok(serde_json::from_str(&body)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
