//! Candidate-endpoint resolution for `connect`
//!
//! A user-supplied endpoint is normalized into an ordered list of candidate
//! URLs tried in sequence: the normalized URL itself, then a loopback
//! alternate (`localhost` ⇄ `127.0.0.1`) for local deployments where only
//! one of the two resolves.

use crate::{Error, Result};
use url::Url;

/// Resolve an endpoint string into the ordered candidate list
///
/// `http`/`https` schemes are upgraded to `ws`/`wss`; anything else besides
/// `ws`/`wss` is rejected. The returned list is deduplicated and never empty.
pub fn resolve_candidates(endpoint: &str) -> Result<Vec<Url>> {
    let mut url =
        Url::parse(endpoint).map_err(|e| Error::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        "http" => {
            // set_scheme rejects ws<->http switches on some url versions; rebuild instead
            url = rewrite_scheme(&url, "ws")?;
        }
        "https" => {
            url = rewrite_scheme(&url, "wss")?;
        }
        other => {
            return Err(Error::InvalidEndpoint(format!(
                "unsupported scheme '{other}' in {endpoint}"
            )));
        }
    }

    let mut candidates = vec![url.clone()];

    if let Some(alternate) = loopback_alternate(&url) {
        candidates.push(alternate);
    }

    candidates.dedup();
    Ok(candidates)
}

fn rewrite_scheme(url: &Url, scheme: &str) -> Result<Url> {
    let raw = format!(
        "{}{}",
        scheme,
        url.as_str()
            .split_once(':')
            .map(|(_, rest)| format!(":{rest}"))
            .unwrap_or_default()
    );
    Url::parse(&raw).map_err(|e| Error::InvalidEndpoint(format!("{raw}: {e}")))
}

fn loopback_alternate(url: &Url) -> Option<Url> {
    let alternate_host = match url.host_str()? {
        "localhost" => "127.0.0.1",
        "127.0.0.1" => "localhost",
        _ => return None,
    };
    let mut alternate = url.clone();
    alternate.set_host(Some(alternate_host)).ok()?;
    Some(alternate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_passes_through() {
        let candidates = resolve_candidates("ws://conf.example.com/ws").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_str(), "ws://conf.example.com/ws");
    }

    #[test]
    fn test_https_upgrades_to_wss() {
        let candidates = resolve_candidates("https://conf.example.com/ws").unwrap();
        assert_eq!(candidates[0].scheme(), "wss");
        assert_eq!(candidates[0].host_str(), Some("conf.example.com"));
    }

    #[test]
    fn test_localhost_gets_loopback_alternate() {
        let candidates = resolve_candidates("ws://localhost:8188/ws").unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].host_str(), Some("localhost"));
        assert_eq!(candidates[1].host_str(), Some("127.0.0.1"));
        assert_eq!(candidates[1].port(), Some(8188));
    }

    #[test]
    fn test_loopback_ip_gets_localhost_alternate() {
        let candidates = resolve_candidates("ws://127.0.0.1:8188/ws").unwrap();
        assert_eq!(candidates[1].host_str(), Some("localhost"));
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(matches!(
            resolve_candidates("ftp://conf.example.com/ws"),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(resolve_candidates("not a url").is_err());
    }
}
