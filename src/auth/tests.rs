use super::*;
use axum::http::HeaderMap;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let headers = headers_with("Bearer s3cret-token");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "s3cret-token");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let headers = headers_with("Bearer   s3cret-token  ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "s3cret-token");
    }

    #[test]
    fn case_insensitive_scheme() {
        let headers = headers_with("bearer s3cret-token");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "s3cret-token");
    }

    #[test]
    fn missing_authorization_header() {
        assert_eq!(
            extract_bearer_token(&HeaderMap::new()),
            Err(TokenError::Missing)
        );
    }

    #[test]
    fn wrong_scheme() {
        let headers = headers_with("Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn scheme_without_token() {
        assert_eq!(
            extract_bearer_token(&headers_with("Bearer")),
            Err(TokenError::InvalidFormat)
        );
        assert_eq!(
            extract_bearer_token(&headers_with("Bearer    ")),
            Err(TokenError::Empty)
        );
    }
}

mod verify_tests {
    use super::*;

    #[test]
    fn matching_token_is_accepted() {
        let headers = headers_with("Bearer abc123");
        assert!(verify_bearer_token(&headers, "abc123").is_ok());
    }

    #[test]
    fn mismatched_token_is_rejected() {
        let headers = headers_with("Bearer abc124");
        assert_eq!(
            verify_bearer_token(&headers, "abc123"),
            Err(TokenError::Mismatch)
        );
        let headers = headers_with("Bearer abc");
        assert_eq!(
            verify_bearer_token(&headers, "abc123"),
            Err(TokenError::Mismatch)
        );
    }

    #[test]
    fn mask_replaces_credential() {
        let mut headers = headers_with("Bearer abc123");
        mask_authorization(&mut headers);
        assert_eq!(headers.get("authorization").unwrap(), MASKED_AUTHORIZATION);

        let mut empty = HeaderMap::new();
        mask_authorization(&mut empty);
        assert!(empty.get("authorization").is_none());
    }
}

#[test]
fn error_messages() {
    assert_eq!(
        TokenError::Missing.to_string(),
        "Authorization token not provided"
    );
    assert_eq!(TokenError::Mismatch.to_string(), "Invalid authorization token");
}
