use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// Longest string we are willing to parse as an address.
const MAX_IP_LEN: usize = 64;

/// Client identity derived from the request: a validated IP (if any) and the user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: String,
}

impl ClientContext {
    /// Resolve the client IP from proxy headers, then the transport peer.
    ///
    /// Proxy headers are attacker-controlled: a candidate is only accepted if it
    /// parses as an IPv4/IPv6 address, and is stored in canonical form.
    pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let ip = first_forwarded_ip(headers)
            .or_else(|| real_ip(headers))
            .or_else(|| peer.map(|p| p.to_string()));

        Self {
            ip,
            user_agent: header_value(headers, "user-agent"),
        }
    }
}

impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self::resolve(&parts.headers, peer))
    }
}

/// Joins every instance of a header with `,` and trims the result. Non-UTF-8 bytes are
/// replaced rather than rejected so one bad instance cannot hide the others.
///
/// Joining means repeated headers read as one proxy chain; callers should not rely on
/// how separate header instances are merged.
fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect::<Vec<_>>()
        .join(",")
        .trim()
        .to_string()
}

fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let raw = header_value(headers, "x-forwarded-for");
    let first = raw
        .split(',')
        .map(strip_segment)
        .find(|segment| !segment.is_empty())?;
    parse_ip(first)
}

fn real_ip(headers: &HeaderMap) -> Option<String> {
    let raw = header_value(headers, "x-real-ip");
    parse_ip(strip_segment(&raw))
}

fn strip_segment(segment: &str) -> &str {
    segment.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Validate a candidate address, returning its canonical textual form.
pub fn parse_ip(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_IP_LEN {
        return None;
    }
    trimmed.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn peer() -> Option<IpAddr> {
        Some("10.0.0.9".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let h = headers(&[("x-forwarded-for", "1.2.3.4, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(ClientContext::resolve(&h, peer()).ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_forwarded_for_quotes_and_whitespace_stripped() {
        let h = headers(&[("x-forwarded-for", "  \"203.0.113.7\" , 10.0.0.1")]);
        assert_eq!(
            ClientContext::resolve(&h, peer()).ip.as_deref(),
            Some("203.0.113.7")
        );
        let h = headers(&[("x-forwarded-for", "'2001:db8::1'")]);
        assert_eq!(
            ClientContext::resolve(&h, peer()).ip.as_deref(),
            Some("2001:db8::1")
        );
    }

    #[test]
    fn test_forwarded_for_skips_empty_segments() {
        let h = headers(&[("x-forwarded-for", " , ,8.8.8.8")]);
        assert_eq!(ClientContext::resolve(&h, peer()).ip.as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn test_junk_forwarded_for_falls_back_to_real_ip() {
        let h = headers(&[
            ("x-forwarded-for", "<script>alert(1)</script>, 1.2.3.4"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(
            ClientContext::resolve(&h, peer()).ip.as_deref(),
            Some("198.51.100.2")
        );
    }

    #[test]
    fn test_junk_headers_fall_back_to_peer() {
        let h = headers(&[("x-forwarded-for", "unknown"), ("x-real-ip", "not-an-ip")]);
        assert_eq!(ClientContext::resolve(&h, peer()).ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_nothing_valid_yields_none() {
        let h = headers(&[("x-forwarded-for", "999.1.1.1")]);
        assert_eq!(ClientContext::resolve(&h, None).ip, None);
        assert_eq!(ClientContext::resolve(&HeaderMap::new(), None).ip, None);
    }

    #[test]
    fn test_malformed_values_never_propagate() {
        let samples = [
            "",
            ",,,",
            "1.2.3",
            "1.2.3.4:8080",
            "1.2.3.4 5.6.7.8",
            "\"\"",
            "localhost",
            "::ffff:zz",
        ];
        for raw in samples {
            let h = headers(&[("x-forwarded-for", raw)]);
            let ip = ClientContext::resolve(&h, None).ip;
            if let Some(ref ip) = ip {
                assert!(ip.parse::<IpAddr>().is_ok(), "{raw:?} resolved to {ip:?}");
            }
        }
    }

    #[test]
    fn test_ipv6_is_canonicalized() {
        let h = headers(&[("x-forwarded-for", "2001:0DB8:0000:0000:0000:0000:0000:0001")]);
        assert_eq!(
            ClientContext::resolve(&h, None).ip.as_deref(),
            Some("2001:db8::1")
        );
    }

    #[test]
    fn test_repeated_forwarded_for_headers_are_joined() {
        let h = headers(&[("x-forwarded-for", "bogus"), ("x-forwarded-for", "4.4.4.4")]);
        // "bogus" is the first non-empty segment of the joined chain and is rejected.
        assert_eq!(ClientContext::resolve(&h, None).ip, None);
    }

    #[test]
    fn test_user_agent_trimmed_and_never_null() {
        let h = headers(&[("user-agent", "  Mozilla/5.0  ")]);
        assert_eq!(ClientContext::resolve(&h, None).user_agent, "Mozilla/5.0");
        assert_eq!(ClientContext::resolve(&HeaderMap::new(), None).user_agent, "");
    }
}
