use std::collections::HashMap;
use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// Derive the full request fingerprint: a stable bucketing key built from
/// connection and header attributes. Missing headers contribute empty
/// components, so the function has no failure mode.
pub fn request_fingerprint(
    ip: IpAddr,
    headers: &HashMap<String, String>,
    method: &str,
    path: &str,
) -> String {
    let components = [
        ip.to_string(),
        header_or_empty(headers, "user-agent"),
        header_or_empty(headers, "accept-language"),
        header_or_empty(headers, "accept-encoding"),
        method.to_string(),
        path.to_string(),
    ];
    sha256_hex(&components.join("|"))
}

/// Narrower derivation bound to the session rather than the request:
/// excludes method/path/encoding so it stays stable across a browsing
/// session. Truncated to 16 hex chars; used as the CSRF token key.
pub fn session_fingerprint(ip: IpAddr, headers: &HashMap<String, String>) -> String {
    let components = [
        ip.to_string(),
        header_or_empty(headers, "user-agent"),
        header_or_empty(headers, "accept-language"),
    ];
    let mut hash = sha256_hex(&components.join("|"));
    hash.truncate(16);
    hash
}

fn header_or_empty(headers: &HashMap<String, String>, name: &str) -> String {
    headers.get(name).cloned().unwrap_or_default()
}

fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("user-agent".to_string(), "Mozilla/5.0".to_string());
        h.insert("accept-language".to_string(), "en-US".to_string());
        h.insert("accept-encoding".to_string(), "gzip".to_string());
        h
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        let h = headers();
        let a = request_fingerprint(ip, &h, "GET", "/api/items");
        let b = request_fingerprint(ip, &h, "GET", "/api/items");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_differs_by_path_and_method() {
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        let h = headers();
        let a = request_fingerprint(ip, &h, "GET", "/api/items");
        let b = request_fingerprint(ip, &h, "POST", "/api/items");
        let c = request_fingerprint(ip, &h, "GET", "/api/other");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_headers_treated_as_empty() {
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        let empty = HashMap::new();
        let a = request_fingerprint(ip, &empty, "GET", "/");
        let b = request_fingerprint(ip, &empty, "GET", "/");
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_fingerprint_stable_across_paths() {
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        let h = headers();
        let s = session_fingerprint(ip, &h);
        assert_eq!(s.len(), 16);
        // Unaffected by method/path, unlike the request fingerprint.
        assert_eq!(s, session_fingerprint(ip, &h));
    }
}
