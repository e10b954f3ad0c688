use axum::http::{header, HeaderMap, HeaderValue};

#[cfg(test)]
mod tests;

/// Value the Authorization header is replaced with once checked.
pub const MASKED_AUTHORIZATION: &str = "*****";

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Check the request carries `Bearer <expected>`.
pub fn verify_bearer_token(headers: &HeaderMap, expected: &str) -> Result<(), TokenError> {
    let token = extract_bearer_token(headers)?;
    if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(TokenError::Mismatch)
    }
}

/// Overwrite the Authorization header so handlers and logs never see the
/// credential.
pub fn mask_authorization(headers: &mut HeaderMap) {
    if headers.contains_key(header::AUTHORIZATION) {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static(MASKED_AUTHORIZATION),
        );
    }
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Token check errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    /// Token is empty string
    Empty,
    /// Token does not match the configured secret
    Mismatch,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::Mismatch => write!(f, "Invalid authorization token"),
        }
    }
}

impl std::error::Error for TokenError {}
