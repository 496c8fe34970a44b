use http::header::{self, HeaderName};
use once_cell::sync::Lazy;
use pingora_error::Result;
use pingora_http::RequestHeader;
use pingora_proxy::Session;

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

static HTTP_HEADER_X_FORWARDED_PROTO: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-proto"));

static HTTP_HEADER_X_FORWARDED_HOST: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-host"));

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// Retrieves the request host (domain name) from the request header.
///
/// Prefers the host from the URI, falls back to the `Host` header.
/// Removes the port number if present in the `Host` header.
pub fn get_request_host(header: &RequestHeader) -> Option<&str> {
    if let Some(host) = header.uri.host() {
        if !host.is_empty() {
            return Some(host);
        }
    }
    header
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|host| host.split(':').next())
        .filter(|host| !host.is_empty())
}

/// Address of the directly connected peer, without the port.
pub fn get_client_ip(session: &Session) -> Option<String> {
    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip().to_string())
}

/// Sets the standard forwarding headers on a request bound upstream.
///
/// `X-Forwarded-For` keeps any list the client sent and appends `client_ip`.
pub fn apply_forwarded_headers(
    upstream_request: &mut RequestHeader,
    client_ip: Option<&str>,
    scheme: &str,
) -> Result<()> {
    if let Some(ip) = client_ip {
        let forwarded_for = match get_req_header_value(upstream_request, "x-forwarded-for") {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        upstream_request.insert_header(HTTP_HEADER_X_FORWARDED_FOR.clone(), forwarded_for)?;
        upstream_request.insert_header(HTTP_HEADER_X_REAL_IP.clone(), ip.to_string())?;
    }

    upstream_request.insert_header(HTTP_HEADER_X_FORWARDED_PROTO.clone(), scheme.to_string())?;

    if let Some(host) = get_request_host(upstream_request).map(str::to_string) {
        upstream_request.insert_header(HTTP_HEADER_X_FORWARDED_HOST.clone(), host)?;
    }

    Ok(())
}

/// True when `Connection` lists the `upgrade` token.
pub fn connection_has_upgrade(req_header: &RequestHeader) -> bool {
    req_header
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

pub fn is_upgrade_request(req_header: &RequestHeader) -> bool {
    req_header.headers.contains_key(header::UPGRADE) && connection_has_upgrade(req_header)
}

/// Leaves the request untouched on routes that allow upgrades and strips
/// the hop-by-hop upgrade headers everywhere else.
pub fn apply_upgrade_policy(upstream_request: &mut RequestHeader, allow: bool) {
    if allow {
        return;
    }

    upstream_request.remove_header(&header::UPGRADE);
    if connection_has_upgrade(upstream_request) {
        upstream_request.remove_header(&header::CONNECTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        for (name, value) in headers {
            req.append_header(name.to_string(), value.to_string())
                .unwrap();
        }
        req
    }

    #[test]
    fn test_request_host_strips_port() {
        let req = request("/", &[("Host", "stack.example.com:8080")]);
        assert_eq!(Some("stack.example.com"), get_request_host(&req));

        let req = request("/", &[]);
        assert_eq!(None, get_request_host(&req));
    }

    #[test]
    fn test_forwarded_headers() {
        let mut req = request("/api/widgets", &[("Host", "stack.example.com")]);
        apply_forwarded_headers(&mut req, Some("10.0.0.7"), "http").unwrap();

        assert_eq!(
            Some("10.0.0.7"),
            get_req_header_value(&req, "x-forwarded-for")
        );
        assert_eq!(Some("10.0.0.7"), get_req_header_value(&req, "x-real-ip"));
        assert_eq!(Some("http"), get_req_header_value(&req, "x-forwarded-proto"));
        assert_eq!(
            Some("stack.example.com"),
            get_req_header_value(&req, "x-forwarded-host")
        );
    }

    #[test]
    fn test_forwarded_for_appends_client() {
        let mut req = request(
            "/",
            &[("Host", "h"), ("X-Forwarded-For", "203.0.113.9")],
        );
        apply_forwarded_headers(&mut req, Some("10.0.0.7"), "https").unwrap();
        assert_eq!(
            Some("203.0.113.9, 10.0.0.7"),
            get_req_header_value(&req, "x-forwarded-for")
        );
    }

    #[test]
    fn test_upgrade_kept_on_upgrade_route() {
        let mut req = request(
            "/_stcore/stream",
            &[("Upgrade", "websocket"), ("Connection", "keep-alive, Upgrade")],
        );
        assert!(is_upgrade_request(&req));

        apply_upgrade_policy(&mut req, true);
        assert_eq!(Some("websocket"), get_req_header_value(&req, "upgrade"));
        assert_eq!(
            Some("keep-alive, Upgrade"),
            get_req_header_value(&req, "connection")
        );
    }

    #[test]
    fn test_upgrade_route_does_not_add_connection_token() {
        let mut req = request("/_stcore/stream", &[("Upgrade", "websocket")]);
        assert!(!is_upgrade_request(&req));

        apply_upgrade_policy(&mut req, true);
        assert_eq!(Some("websocket"), get_req_header_value(&req, "upgrade"));
        assert!(req.headers.get("connection").is_none());
    }

    #[test]
    fn test_upgrade_stripped_elsewhere() {
        let mut req = request(
            "/api/widgets",
            &[("Upgrade", "websocket"), ("Connection", "Upgrade")],
        );
        apply_upgrade_policy(&mut req, false);
        assert!(req.headers.get("upgrade").is_none());
        assert!(req.headers.get("connection").is_none());

        let mut req = request("/api/widgets", &[("Connection", "keep-alive")]);
        apply_upgrade_policy(&mut req, false);
        assert_eq!(Some("keep-alive"), get_req_header_value(&req, "connection"));
        assert!(!is_upgrade_request(&req));
    }
}
