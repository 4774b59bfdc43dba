use crate::server::response::ApiError;

pub const MAX_ALIAS_LEN: usize = 40;
pub const MAX_ROLE_LEN: usize = 50;
pub const MAX_SUBJECT_LEN: usize = 200;
pub const MAX_BODY_BYTES: usize = 64 * 1024;
pub const MAX_HUMAN_NAME_LEN: usize = 64;
pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_PATH_LEN: usize = 1024;

/// Aliases are lowercase, start with a letter, then letters/digits/hyphens,
/// at most 40 chars.
pub fn is_valid_alias(alias: &str) -> bool {
    if alias.is_empty() || alias.len() > MAX_ALIAS_LEN {
        return false;
    }
    let mut chars = alias.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn validate_alias(alias: &str) -> Result<(), ApiError> {
    if is_valid_alias(alias) {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            "Invalid alias: lowercase letter followed by lowercase letters, digits, or hyphens, max 40 chars",
        ))
    }
}

pub fn validate_role(role: &str) -> Result<(), ApiError> {
    if role.len() > MAX_ROLE_LEN {
        return Err(ApiError::bad_request(format!(
            "role cannot exceed {MAX_ROLE_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_subject(subject: &str) -> Result<(), ApiError> {
    if subject.trim().is_empty() {
        return Err(ApiError::bad_request("subject cannot be empty"));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(ApiError::bad_request(format!(
            "subject cannot exceed {MAX_SUBJECT_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> Result<(), ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("body cannot be empty"));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::bad_request(format!(
            "body cannot exceed {MAX_BODY_BYTES} bytes"
        )));
    }
    Ok(())
}

pub fn validate_human_name(name: &str) -> Result<(), ApiError> {
    if name.len() > MAX_HUMAN_NAME_LEN {
        return Err(ApiError::bad_request(format!(
            "human_name cannot exceed {MAX_HUMAN_NAME_LEN} characters"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ApiError::bad_request(
            "human_name cannot contain control characters",
        ));
    }
    Ok(())
}

/// Project slugs follow the alias shape (they address projects in URLs and
/// stream filters).
pub fn validate_project_slug(slug: &str) -> Result<(), ApiError> {
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return Err(ApiError::bad_request(format!(
            "project slug must be 1-{MAX_SLUG_LEN} characters"
        )));
    }
    let mut chars = slug.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit());
    if !first_ok
        || !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ApiError::bad_request(
            "project slug can only contain lowercase letters, digits, and hyphens",
        ));
    }
    Ok(())
}

pub fn validate_bead_id(bead_id: &str) -> Result<(), ApiError> {
    if crate::sync::is_valid_bead_id(bead_id) {
        Ok(())
    } else {
        let shown: String = bead_id.chars().take(100).collect();
        Err(ApiError::bad_request(format!(
            "Invalid bead_id format: {shown}"
        )))
    }
}

pub fn validate_reservation_path(path: &str) -> Result<(), ApiError> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(ApiError::bad_request(format!(
            "path must be 1-{MAX_PATH_LEN} characters"
        )));
    }
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(ApiError::bad_request(
            "path must be repo-relative without '..' segments",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_shapes() {
        assert!(is_valid_alias("alice"));
        assert!(is_valid_alias("a"));
        assert!(is_valid_alias("agent-2"));
        assert!(!is_valid_alias("Alice"));
        assert!(!is_valid_alias("2fast"));
        assert!(!is_valid_alias("-lead"));
        assert!(!is_valid_alias(""));
        assert!(!is_valid_alias(&"a".repeat(MAX_ALIAS_LEN + 1)));
    }

    #[test]
    fn body_bounds() {
        assert!(validate_body("x").is_ok());
        assert!(validate_body("").is_err());
        assert!(validate_body(&"x".repeat(MAX_BODY_BYTES)).is_ok());
        assert!(validate_body(&"x".repeat(MAX_BODY_BYTES + 1)).is_err());
    }

    #[test]
    fn subject_bounds() {
        assert!(validate_subject("hello").is_ok());
        assert!(validate_subject("  ").is_err());
        assert!(validate_subject(&"s".repeat(MAX_SUBJECT_LEN + 1)).is_err());
    }

    #[test]
    fn reservation_paths() {
        assert!(validate_reservation_path("src/x.py").is_ok());
        assert!(validate_reservation_path("/etc/passwd").is_err());
        assert!(validate_reservation_path("a/../b").is_err());
    }
}
