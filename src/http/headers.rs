//! Header policy: hop-by-hop filtering, forwarded-header injection and
//! host rewrite.
//!
//! Hop-by-hop headers apply to a single transport hop (RFC 7230 §6.1) and
//! are stripped in both directions. The upgrade request toward the backend
//! additionally drops the client's `sec-websocket-*` set, since the
//! backend-side WebSocket client performs its own handshake.

use crate::config::ProxyConfig;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use std::net::IpAddr;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const WEBSOCKET_STRIP: &[&str] = &[
    "sec-websocket-accept",
    "sec-websocket-extensions",
    "sec-websocket-key",
    "sec-websocket-protocol",
    "sec-websocket-version",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn is_websocket_internal(name: &str) -> bool {
    WEBSOCKET_STRIP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// `host[:port]` for the backend, with the port elided when it is the
/// scheme default.
pub(crate) fn authority(cfg: &ProxyConfig) -> String {
    if cfg.port == cfg.scheme.default_port() {
        cfg.host.clone()
    } else {
        format!("{}:{}", cfg.host, cfg.port)
    }
}

/// Prepare the outbound header set for an HTTP re-origination.
///
/// Order: copy non-hop-by-hop headers, inject the forwarded triple,
/// rewrite host, then apply `remove_headers` / `add_headers` last.
pub(crate) fn prepare_outbound(
    cfg: &ProxyConfig,
    inbound: &HeaderMap,
    remote_ip: Option<IpAddr>,
    inbound_https: bool,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 4);
    let inbound_host = inbound.get(HOST).cloned();

    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == &HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(ip) = remote_ip {
        let forwarded = match out.get(&X_FORWARDED_FOR).map(HeaderValue::to_str) {
            Some(Ok(existing)) => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::try_from(forwarded) {
            out.insert(X_FORWARDED_FOR, value);
        }
    }

    let proto = if inbound_https { "https" } else { "http" };
    out.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if let Some(host) = inbound_host {
        out.insert(X_FORWARDED_HOST, host);
    }

    if let Ok(value) = HeaderValue::try_from(authority(cfg)) {
        out.insert(HOST, value);
    }

    apply_custom(cfg, &mut out);
    out
}

/// Prepare the carried header set for the backend upgrade request.
///
/// Hop-by-hop and `sec-websocket-*` headers are dropped, and host is left
/// absent: the WebSocket client derives it from the request URI, which is
/// built from the configured authority.
pub(crate) fn prepare_upgrade(cfg: &ProxyConfig, inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || is_websocket_internal(name.as_str()) || name == &HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    apply_custom(cfg, &mut out);
    out
}

/// Copy a backend response header set, dropping hop-by-hop headers.
pub(crate) fn filter_response(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Apply configured removals, then additions, in that order. Additions
/// preserve insertion order and may duplicate.
fn apply_custom(cfg: &ProxyConfig, out: &mut HeaderMap) {
    for name in &cfg.remove_headers {
        out.remove(name.as_str());
    }
    for (name, value) in &cfg.add_headers {
        out.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxyOptions};
    use crate::pool::default_pool;

    fn config_with(backend: &str, mutate: impl FnOnce(&mut ProxyOptions)) -> ProxyConfig {
        let mut options = ProxyOptions {
            backend: backend.to_string(),
            ..ProxyOptions::default()
        };
        mutate(&mut options);
        ProxyConfig::build(default_pool(), options).unwrap()
    }

    fn inbound(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::try_from(*value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn hop_by_hop_set() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("upgrade"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("host"));
    }

    #[test]
    fn strips_hop_by_hop_and_rewrites_host() {
        let cfg = config_with("http://backend:4001", |_| {});
        let headers = inbound(&[
            ("host", "proxy.local"),
            ("connection", "keep-alive"),
            ("accept", "text/plain"),
        ]);
        let out = prepare_outbound(&cfg, &headers, None, false);
        assert!(out.get("connection").is_none());
        assert_eq!(out.get(HOST).unwrap(), "backend:4001");
        assert_eq!(out.get("accept").unwrap(), "text/plain");
    }

    #[test]
    fn host_port_elided_when_default() {
        let cfg = config_with("http://backend", |_| {});
        let out = prepare_outbound(&cfg, &HeaderMap::new(), None, false);
        assert_eq!(out.get(HOST).unwrap(), "backend");

        let cfg = config_with("https://backend:443", |_| {});
        let out = prepare_outbound(&cfg, &HeaderMap::new(), None, true);
        assert_eq!(out.get(HOST).unwrap(), "backend");
    }

    #[test]
    fn forwarded_for_set_and_appended() {
        let cfg = config_with("http://backend", |_| {});
        let ip: IpAddr = "10.0.0.9".parse().unwrap();

        let out = prepare_outbound(&cfg, &HeaderMap::new(), Some(ip), false);
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.9");

        let headers = inbound(&[("x-forwarded-for", "192.168.1.1")]);
        let out = prepare_outbound(&cfg, &headers, Some(ip), false);
        assert_eq!(out.get("x-forwarded-for").unwrap(), "192.168.1.1, 10.0.0.9");
    }

    #[test]
    fn forwarded_proto_overwrites() {
        let cfg = config_with("http://backend", |_| {});
        let headers = inbound(&[("x-forwarded-proto", "https")]);
        let out = prepare_outbound(&cfg, &headers, None, false);
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        let out = prepare_outbound(&cfg, &headers, None, true);
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn forwarded_host_only_when_inbound_host_present() {
        let cfg = config_with("http://backend", |_| {});
        let out = prepare_outbound(&cfg, &HeaderMap::new(), None, false);
        assert!(out.get("x-forwarded-host").is_none());

        let headers = inbound(&[("host", "public.example")]);
        let out = prepare_outbound(&cfg, &headers, None, false);
        assert_eq!(out.get("x-forwarded-host").unwrap(), "public.example");
    }

    #[test]
    fn removals_run_before_additions() {
        let cfg = config_with("http://backend", |o| {
            o.remove_headers = vec!["X-Secret".to_string()];
            o.add_headers = vec![
                ("x-secret".to_string(), "injected".to_string()),
                ("x-tag".to_string(), "a".to_string()),
                ("x-tag".to_string(), "b".to_string()),
            ];
        });
        let headers = inbound(&[("x-secret", "leaked")]);
        let out = prepare_outbound(&cfg, &headers, None, false);
        let secrets: Vec<_> = out.get_all("x-secret").iter().collect();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0], "injected");
        let tags: Vec<_> = out.get_all("x-tag").iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn upgrade_headers_drop_websocket_internals() {
        let cfg = config_with("http://backend", |_| {});
        let headers = inbound(&[
            ("host", "proxy.local"),
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-key", "abc=="),
            ("sec-websocket-version", "13"),
            ("sec-websocket-protocol", "chat"),
            ("cookie", "sid=1"),
        ]);
        let out = prepare_upgrade(&cfg, &headers);
        assert!(out.get("sec-websocket-key").is_none());
        assert!(out.get("sec-websocket-version").is_none());
        assert!(out.get("sec-websocket-protocol").is_none());
        assert!(out.get("connection").is_none());
        assert!(out.get("upgrade").is_none());
        assert!(out.get(HOST).is_none());
        assert_eq!(out.get("cookie").unwrap(), "sid=1");
    }

    #[test]
    fn response_filter_drops_hop_by_hop_only() {
        let headers = inbound(&[
            ("transfer-encoding", "chunked"),
            ("connection", "close"),
            ("content-type", "application/json"),
        ]);
        let out = filter_response(&headers);
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("connection").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }
}
