//! Canonicalisation of git remote URLs.
//!
//! Repos are keyed by canonical origin, e.g. `github.com/org/repo`, so that
//! `https://github.com/Org/Repo.git` and `git@github.com:org/repo` resolve
//! to the same row.

const MAX_ORIGIN_LEN: usize = 2048;

/// Normalise a git remote URL to `host/path` form: scheme and userinfo
/// stripped, host lowercased, `.git` suffix and trailing slashes removed.
pub fn canonicalize_git_url(url: &str) -> String {
    let mut rest = url.trim();

    for scheme in ["https://", "http://", "ssh://", "git://", "file://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }

    // scp-like syntax: git@host:org/repo
    let rest = match rest.split_once('@') {
        Some((_user, tail)) => tail.replacen(':', "/", 1),
        None => rest.to_string(),
    };

    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    match rest.split_once('/') {
        Some((host, path)) => {
            // Drop an explicit port; canonical form is hostname only.
            let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
            format!("{host}/{path}")
        }
        None => rest.to_ascii_lowercase(),
    }
}

/// Last path segment of a canonical origin, used as the repo display name.
pub fn extract_repo_name(canonical_origin: &str) -> String {
    canonical_origin
        .rsplit('/')
        .next()
        .unwrap_or(canonical_origin)
        .to_string()
}

pub fn is_valid_canonical_origin(origin: &str) -> bool {
    if origin.is_empty() || origin.len() > MAX_ORIGIN_LEN {
        return false;
    }
    if origin.contains("..") || origin.contains(char::is_whitespace) {
        return false;
    }
    origin.contains('/')
        && origin
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_and_ssh_forms_agree() {
        assert_eq!(
            canonicalize_git_url("https://github.com/Acme/widgets.git"),
            "github.com/Acme/widgets"
        );
        assert_eq!(
            canonicalize_git_url("git@github.com:Acme/widgets.git"),
            "github.com/Acme/widgets"
        );
        assert_eq!(
            canonicalize_git_url("ssh://git@github.com/Acme/widgets"),
            "github.com/Acme/widgets"
        );
    }

    #[test]
    fn host_is_lowercased_path_is_not() {
        assert_eq!(
            canonicalize_git_url("https://GitHub.COM/Acme/Widgets"),
            "github.com/Acme/Widgets"
        );
    }

    #[test]
    fn port_is_dropped() {
        assert_eq!(
            canonicalize_git_url("ssh://git@gitlab.local:2222/team/repo.git"),
            "gitlab.local/team/repo"
        );
    }

    #[test]
    fn repo_name_is_last_segment() {
        assert_eq!(extract_repo_name("github.com/acme/widgets"), "widgets");
    }

    #[test]
    fn validity_checks() {
        assert!(is_valid_canonical_origin("github.com/acme/widgets"));
        assert!(!is_valid_canonical_origin("no-slash"));
        assert!(!is_valid_canonical_origin("github.com/../etc"));
        assert!(!is_valid_canonical_origin(""));
    }
}
