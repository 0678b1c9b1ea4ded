//! Canonical lab hostnames.
//!
//! The lock service keys nodes by fully qualified name
//! (`smithi001.front.example.com`) but operators type short names,
//! `user@host` targets, or already-qualified names interchangeably.

use std::net::IpAddr;

/// Normalize `name` to `shortname.lab_domain`.
///
/// - a leading `user@` is dropped
/// - a name already ending in `.lab_domain` keeps its short part intact
///   (dots included); anything else is cut at the first dot
/// - IP literals are returned as-is
/// - an empty `lab_domain` yields the bare short name
pub fn canonicalize_hostname(name: &str, lab_domain: &str) -> String {
    let host = match name.rsplit_once('@') {
        Some((_, host)) => host,
        None => name,
    };

    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    let domain = lab_domain.trim_matches('.');
    let shortname = if domain.is_empty() {
        host.split('.').next().unwrap_or(host)
    } else {
        match host.strip_suffix(domain).and_then(|s| s.strip_suffix('.')) {
            Some(short) => short,
            None => host.split('.').next().unwrap_or(host),
        }
    };

    if domain.is_empty() || shortname.ends_with('.') {
        shortname.to_string()
    } else {
        format!("{shortname}.{domain}")
    }
}
