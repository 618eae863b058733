//! Argument validation for the three tool-facing operations.
//!
//! Every rule is checked and all violations are returned in a single
//! `ValidationFailed`, so callers can fix everything in one round-trip.

use searchpipe_core::{ApiError, CrawlRequest, NewsRequest, Result, SearchRequest, TimeRange};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Host;

pub const MAX_QUERY_CHARS: usize = 500;
pub const MAX_RESULTS: usize = 50;
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// Loosely-typed query arguments as they arrive from a tool call or CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryArgs {
    pub query: Option<String>,
    pub max_results: Option<i64>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub time_range: Option<String>,
    pub site: Option<String>,
}

pub fn parse_time_range(s: &str) -> Option<TimeRange> {
    match s.trim().to_ascii_lowercase().as_str() {
        "day" | "d" => Some(TimeRange::Day),
        "week" | "w" => Some(TimeRange::Week),
        "month" | "m" => Some(TimeRange::Month),
        "year" | "y" => Some(TimeRange::Year),
        _ => None,
    }
}

/// `en`, `deu`, `en-US`, `pt_br`. Returned lowercased with `-` as separator.
fn region_code(field: &str, raw: &str, problems: &mut Vec<String>) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let mut parts = s.split(['-', '_']);
    let base = parts.next().unwrap_or_default();
    let region = parts.next();
    let ok = (2..=3).contains(&base.len())
        && base.chars().all(|c| c.is_ascii_alphabetic())
        && region.map_or(true, |r| r.len() == 2 && r.chars().all(|c| c.is_ascii_alphabetic()))
        && parts.next().is_none();
    if !ok {
        problems.push(format!("{field} must be a short code like \"en\" or \"en-US\", got {s:?}"));
        return None;
    }
    Some(s.to_ascii_lowercase().replace('_', "-"))
}

struct Checked {
    query: String,
    max_results: Option<usize>,
    language: Option<String>,
    country: Option<String>,
    time_range: Option<TimeRange>,
}

fn check_common(args: &QueryArgs, problems: &mut Vec<String>) -> Checked {
    let query = args.query.as_deref().unwrap_or_default().trim().to_string();
    if query.is_empty() {
        problems.push("query must not be empty".to_string());
    } else if query.chars().count() > MAX_QUERY_CHARS {
        problems.push(format!("query must be at most {MAX_QUERY_CHARS} characters"));
    }

    let max_results = match args.max_results {
        None => None,
        Some(n) if (1..=MAX_RESULTS as i64).contains(&n) => Some(n as usize),
        Some(n) => {
            problems.push(format!("max_results must be between 1 and {MAX_RESULTS}, got {n}"));
            None
        }
    };

    let language = args
        .language
        .as_deref()
        .and_then(|s| region_code("language", s, problems));
    let country = args
        .country
        .as_deref()
        .and_then(|s| region_code("country", s, problems));

    let time_range = match args.time_range.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => match parse_time_range(s) {
            Some(t) => Some(t),
            None => {
                problems.push(format!(
                    "time_range must be one of day, week, month, year; got {s:?}"
                ));
                None
            }
        },
    };

    Checked {
        query,
        max_results,
        language,
        country,
        time_range,
    }
}

fn finish<T>(value: T, problems: Vec<String>) -> Result<T> {
    if problems.is_empty() {
        Ok(value)
    } else {
        Err(ApiError::validation(problems))
    }
}

pub fn search_request(args: &QueryArgs) -> Result<SearchRequest> {
    let mut problems = Vec::new();
    let c = check_common(args, &mut problems);
    let site = match args.site.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) if s.len() <= 253 && !s.contains(char::is_whitespace) && !s.contains('/') => {
            Some(s.to_ascii_lowercase())
        }
        Some(s) => {
            problems.push(format!("site must be a bare domain, got {s:?}"));
            None
        }
    };
    finish(
        SearchRequest {
            query: c.query,
            max_results: c.max_results,
            language: c.language,
            country: c.country,
            time_range: c.time_range,
            site,
        },
        problems,
    )
}

pub fn news_request(args: &QueryArgs) -> Result<NewsRequest> {
    let mut problems = Vec::new();
    let c = check_common(args, &mut problems);
    if args.site.as_deref().is_some_and(|s| !s.trim().is_empty()) {
        problems.push("site is not supported for news".to_string());
    }
    finish(
        NewsRequest {
            query: c.query,
            max_results: c.max_results,
            language: c.language,
            country: c.country,
            time_range: c.time_range,
        },
        problems,
    )
}

fn ipv4_is_internal(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 (carrier-grade NAT)
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn ipv6_is_internal(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return ipv4_is_internal(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local
        || (first & 0xffc0) == 0xfe80 // link local
}

/// Hosts a crawl must not reach unless explicitly allowed. Name resolution is
/// not performed; only literal addresses and well-known local names are caught.
pub fn is_internal_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(d) => {
            let d = d.trim_end_matches('.').to_ascii_lowercase();
            d == "localhost" || d.ends_with(".localhost") || d.ends_with(".local")
        }
        Host::Ipv4(ip) => is_internal_ip(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => is_internal_ip(IpAddr::V6(*ip)),
    }
}

pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_is_internal(v4),
        IpAddr::V6(v6) => ipv6_is_internal(v6),
    }
}

/// Validate a crawl target. Shape problems are `ValidationFailed`; embedded
/// credentials and internal hosts are `SecurityRejected`.
pub fn crawl_request(url: Option<&str>, allow_internal_hosts: bool) -> Result<CrawlRequest> {
    let raw = url.unwrap_or_default().trim();
    if raw.is_empty() {
        return Err(ApiError::validation(vec!["url must not be empty".to_string()]));
    }
    let parsed = CrawlRequest {
        url: raw.to_string(),
    }
    .parsed_url()?;

    let mut problems = Vec::new();
    if !matches!(parsed.scheme(), "http" | "https") {
        problems.push(format!("url scheme must be http or https, got {:?}", parsed.scheme()));
    }
    let host = parsed.host();
    if host.is_none() {
        problems.push("url must have a host".to_string());
    }
    if !problems.is_empty() {
        return Err(ApiError::validation(problems));
    }

    let mut rejected = Vec::new();
    if !parsed.username().is_empty() || parsed.password().is_some() {
        rejected.push("url must not embed credentials".to_string());
    }
    if let Some(h) = &host {
        if !allow_internal_hosts && is_internal_host(h) {
            rejected.push(format!("host {h} is private, loopback or link-local"));
        }
    }
    if !rejected.is_empty() {
        return Err(ApiError::security(rejected));
    }

    Ok(CrawlRequest {
        url: parsed.to_string(),
    })
}
