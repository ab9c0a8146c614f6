//! Path-prefix routing for gTunnel Relay
//!
//! The first path segment selects the tunnel; the agent only ever sees the
//! rest of the path.

use gtunnel_shared::{Error, Result};

/// Split `path` into `(prefix, remaining_path)`.
///
/// `/app-1/a/b` routes to `("app-1", "/a/b")` and `/app-1` to `("app-1", "/")`.
pub fn route(path: &str) -> Result<(String, String)> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (prefix, rest) = match trimmed.split_once('/') {
        Some((prefix, rest)) => (prefix, rest),
        None => (trimmed, ""),
    };

    if prefix.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }

    Ok((prefix.to_string(), format!("/{}", rest)))
}
