//! Registry path recognition.
//!
//! npm clients address packages with four path shapes:
//!
//! - `/{name}`                            - unscoped metadata
//! - `/{name}/-/{name}-{version}.tgz`     - unscoped tarball
//! - `/@{scope}/{name}`                   - scoped metadata
//! - `/@{scope}/{name}/-/{name}-{version}.tgz` - scoped tarball
//!
//! Scoped metadata is usually requested as `/@scope%2fname`; the first
//! escaped slash in a path is decoded by [`decode_escaped_slash`] before
//! routing, so both spellings reach the same resource.

use axum::extract::Request;
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::Response;
use tracing::trace;

use super::handler::AppError;
use crate::registry::{PackageIdentity, TarballRequest};

/// A recognised registry resource.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryRoute {
    Metadata(PackageIdentity),
    Tarball(TarballRequest),
}

impl RegistryRoute {
    /// Classify a request path.
    ///
    /// Paths that do not have one of the registry shapes yield
    /// [`AppError::NotFound`]; paths that have the shape but carry an
    /// unusable package name or tarball filename yield
    /// [`AppError::MalformedRequest`].
    pub fn parse(path: &str) -> Result<Self, AppError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = trimmed.split('/').collect();

        // `/-/...` is the registry's own API namespace, never a package.
        if segments.iter().any(|s| s.is_empty()) || segments[0] == "-" {
            return Err(AppError::NotFound);
        }

        let route = match segments.as_slice() {
            [name] => Self::Metadata(PackageIdentity::unscoped(name).map_err(malformed)?),
            [name, "-", filename] => {
                let identity = PackageIdentity::unscoped(name).map_err(malformed)?;
                Self::Tarball(TarballRequest::from_filename(identity, filename).map_err(malformed)?)
            }
            [scope, name] => Self::Metadata(PackageIdentity::scoped(scope, name).map_err(malformed)?),
            [scope, name, "-", filename] => {
                let identity = PackageIdentity::scoped(scope, name).map_err(malformed)?;
                Self::Tarball(TarballRequest::from_filename(identity, filename).map_err(malformed)?)
            }
            _ => return Err(AppError::NotFound),
        };
        Ok(route)
    }
}

fn malformed(err: anyhow::Error) -> AppError {
    AppError::MalformedRequest(err.to_string())
}

// ---------------------------------------------------------------------------
// Escaped-slash decoding
// ---------------------------------------------------------------------------

/// Middleware replacing the first `%2f` (any case) in the request path with
/// `/` before the router sees it.
pub async fn decode_escaped_slash(mut req: Request, next: Next) -> Response {
    if let Some(rewritten) = decode_first_escaped_slash(req.uri()) {
        trace!(from = %req.uri(), to = %rewritten, "decoded escaped slash");
        *req.uri_mut() = rewritten;
    }
    next.run(req).await
}

fn decode_first_escaped_slash(uri: &Uri) -> Option<Uri> {
    let path = uri.path();
    // ASCII lowercasing keeps byte offsets intact.
    let idx = path.to_ascii_lowercase().find("%2f")?;

    let mut rewritten = format!("{}/{}", &path[..idx], &path[idx + 3..]);
    if let Some(query) = uri.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(rewritten.parse().ok()?);
    Uri::from_parts(parts).ok()
}
