//! Rewrite tarball URLs in package metadata so clients download through
//! this proxy instead of straight from the upstream registry.
//!
//! Only `versions.<v>.dist.tarball` entries whose origin matches the
//! upstream registry are touched; the rest of the document passes through
//! untouched.  The input is borrowed and a new document is returned.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::trace;
use url::Url;

/// Rewrites upstream tarball URLs to `{public_url}/{full_name}/-/{file}`.
#[derive(Debug, Clone)]
pub struct MetadataPatcher {
    upstream: Url,
    public_url: String,
    registry_name: String,
}

impl MetadataPatcher {
    pub fn new(upstream_url: &str, public_url: &str, registry_name: &str) -> Result<Self> {
        let upstream = Url::parse(upstream_url)
            .with_context(|| format!("invalid upstream registry URL: {upstream_url}"))?;
        Url::parse(public_url).with_context(|| format!("invalid public URL: {public_url}"))?;
        Ok(Self {
            upstream,
            public_url: public_url.trim_end_matches('/').to_owned(),
            registry_name: registry_name.to_owned(),
        })
    }

    /// Return a copy of `document` with every upstream tarball URL pointing
    /// at this proxy.  Applying it to its own output changes nothing.
    pub fn patch(&self, full_name: &str, document: &Value) -> Value {
        let mut patched = document.clone();

        let Some(versions) = patched.get_mut("versions").and_then(Value::as_object_mut) else {
            return patched;
        };

        let short_name = full_name.rsplit('/').next().unwrap_or(full_name);
        let mut rewritten = 0usize;

        for (version, manifest) in versions.iter_mut() {
            let Some(Value::String(tarball)) = manifest.pointer_mut("/dist/tarball") else {
                continue;
            };
            if let Some(url) = self.rewrite_tarball(full_name, short_name, version, tarball)
                && url != *tarball
            {
                *tarball = url;
                rewritten += 1;
            }
        }

        trace!(
            registry = %self.registry_name,
            package = %full_name,
            rewritten,
            "patched metadata tarball URLs"
        );
        patched
    }

    fn rewrite_tarball(
        &self,
        full_name: &str,
        short_name: &str,
        version: &str,
        tarball: &str,
    ) -> Option<String> {
        let parsed = Url::parse(tarball).ok()?;
        if parsed.origin() != self.upstream.origin() {
            return None;
        }

        let filename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{short_name}-{version}.tgz"));

        Some(format!("{}/{full_name}/-/{filename}", self.public_url))
    }
}
