//! Repository URL normalization.
//!
//! Shared providers bind one long-lived service to each repository. The
//! binding key must be the same for every spelling of the same URL.

use sha2::{Digest, Sha256};

/// Key used when a session names no repository.
pub const DEFAULT_REPOSITORY_KEY: &str = "shared";

/// Derives a stable key from a repository URL.
///
/// Strips the scheme and a trailing `.git`, lowercases, and replaces every
/// run of non-alphanumeric characters with a single `-`.
///
/// ```
/// use tasklift::repository::repository_key;
///
/// assert_eq!(repository_key("https://github.com/Acme/App.git"), "github-com-acme-app");
/// assert_eq!(repository_key("git@github.com:acme/app.git"), "github-com-acme-app");
/// ```
pub fn repository_key(url: &str) -> String {
    let mut rest = url.trim();
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
    }
    // scp-like `user@host:path`
    if let Some(idx) = rest.find('@')
        && !rest[..idx].contains('/')
    {
        rest = &rest[idx + 1..];
    }
    let rest = rest.trim_end_matches('/');
    let rest = rest
        .strip_suffix(".git")
        .or_else(|| rest.strip_suffix(".GIT"))
        .unwrap_or(rest);

    let mut key = String::with_capacity(rest.len());
    for c in rest.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('-') {
            key.push('-');
        }
    }
    let key = key.trim_matches('-');
    if key.is_empty() {
        DEFAULT_REPOSITORY_KEY.to_string()
    } else {
        key.to_string()
    }
}

/// Extracts `owner/repo` from a GitHub URL or an `owner/repo` string.
pub fn github_owner_repo(url: &str) -> Option<String> {
    let mut rest = url.trim();
    for prefix in ["https://", "http://", "ssh://", "git@", "git://"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    if let Some(stripped) = rest.strip_prefix("github.com") {
        rest = stripped.trim_start_matches([':', '/']);
    } else if rest.contains("://") || (rest.contains('.') && rest.split('/').count() > 2) {
        return None;
    }
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);

    let mut parts = rest.split('/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if parts.next().is_some() || owner.is_empty() || repo.is_empty() {
        return None;
    }
    let valid = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if valid(owner) && valid(repo) {
        Some(format!("{}/{}", owner, repo))
    } else {
        None
    }
}

/// Builds a provider resource name of at most `max_len` characters.
///
/// Names that fit are `prefix-key`. Longer ones are cut and suffixed with a
/// digest of the full key so two long keys sharing a prefix stay distinct.
pub fn service_name(prefix: &str, key: &str, max_len: usize) -> String {
    let full = format!("{}-{}", prefix, key);
    if full.len() <= max_len {
        return full;
    }
    let digest = Sha256::digest(key.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    let keep = max_len.saturating_sub(suffix.len() + 1);
    let head: String = full.chars().take(keep).collect();
    format!("{}-{}", head.trim_end_matches('-'), suffix)
}
