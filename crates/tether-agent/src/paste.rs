//! Interactive authorization by pasting the code back into the terminal.

use std::io::{BufRead, Write};

use tether_auth::{AuthError, AuthorizationGrant, AuthorizationRequest, Authorizer};

/// Prints the authorization URL and reads the code (or the full redirect URL) from stdin.
#[derive(Debug, Default)]
pub struct PasteAuthorizer;

impl Authorizer for PasteAuthorizer {
    fn authorize(&self, request: &AuthorizationRequest) -> Result<AuthorizationGrant, AuthError> {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "\nOpen this URL to authorize the agent:\n\n  {}\n", request.url)?;
        write!(stderr, "Paste the authorization code or redirect URL: ")?;
        stderr.flush()?;

        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line)?;
        extract_code(&line, &request.state).map(AuthorizationGrant::Code)
    }
}

/// Pull the code out of a bare code or a redirect URL, checking `state` when present.
pub fn extract_code(input: &str, expected_state: &str) -> Result<String, AuthError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::NotAuthorized("no authorization code entered".into()));
    }
    let Some((_, query)) = input.split_once('?') else {
        return Ok(input.to_string());
    };

    let query = query.split('#').next().unwrap_or_default();
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("code", v)) => code = Some(v.to_string()),
            Some(("state", v)) => state = Some(v.to_string()),
            Some(("error", v)) => error = Some(v.to_string()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Err(AuthError::NotAuthorized(format!("authorization denied: {error}")));
    }
    if state.as_deref().is_some_and(|s| s != expected_state) {
        return Err(AuthError::NotAuthorized("state mismatch in redirect URL".into()));
    }
    code.filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::NotAuthorized("redirect URL has no code".into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
