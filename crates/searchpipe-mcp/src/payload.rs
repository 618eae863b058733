use searchpipe_core::{
    ApiError, CrawlResponse, ErrorKind, NewsResponse, ResponseSource, Result, SearchResponse, Served,
};
use searchpipe_local::validate::{self, QueryArgs};
use searchpipe_local::SearchClient;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub(crate) const SCHEMA_VERSION: u64 = 1;

/// The client, or the configuration error that prevented building one. Tools still
/// answer (with `CONFIG_ERROR`) when the environment is incomplete.
pub(crate) type ClientSlot = std::result::Result<Arc<SearchClient>, ApiError>;

pub(crate) fn client_from_env() -> ClientSlot {
    SearchClient::from_env().map(Arc::new)
}

pub(crate) fn warning_hint(code: &'static str) -> Option<&'static str> {
    match code {
        "served_from_cache" => Some(
            "This result was served from the in-memory cache. Call searchpipe_cache_invalidate to force a refresh.",
        ),
        "no_results" => Some(
            "The upstream returned no results. Try a broader query, drop time_range/site, or raise max_results.",
        ),
        "empty_content" => Some(
            "The page was crawled but no text content came back. The page may be script-rendered or behind a login.",
        ),
        _ => None,
    }
}

pub(crate) fn warning_hints_from(codes: &[&'static str]) -> serde_json::Value {
    let mut m = serde_json::Map::new();
    for c in codes {
        if let Some(h) = warning_hint(c) {
            m.insert((*c).to_string(), serde_json::json!(h));
        }
    }
    serde_json::Value::Object(m)
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    // Always present: null or object.
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn error_hint(err: &ApiError) -> String {
    match &err.kind {
        ErrorKind::ApiKeyInvalid => {
            "The upstream rejected the API key. Check SEARCHPIPE_API_KEY (server env).".to_string()
        }
        ErrorKind::RateLimited {
            reset_at_epoch_s: Some(reset),
        } => format!(
            "Rate limited by the upstream. Quota resets at epoch {reset} (in {}s); retry after that.",
            reset.saturating_sub(now_epoch_s())
        ),
        ErrorKind::RateLimited {
            reset_at_epoch_s: None,
        } => "Rate limited by the upstream. Retry later or reduce request volume.".to_string(),
        ErrorKind::NetworkFailure { .. } => {
            "The upstream could not be reached. Check SEARCHPIPE_BASE_URL and network/proxy settings."
                .to_string()
        }
        ErrorKind::Timeout => {
            "The upstream did not answer in time. Retry, or raise SEARCHPIPE_TIMEOUT_MS.".to_string()
        }
        ErrorKind::ServerFault { status } => {
            format!("The upstream failed with HTTP {status}. Retry later.")
        }
        ErrorKind::ValidationFailed { messages } => {
            format!("Fix the arguments: {}", messages.join("; "))
        }
        ErrorKind::ConfigInvalid { messages } => format!(
            "Fix the server configuration ({}). Run `searchpipe doctor` to inspect it.",
            messages.join("; ")
        ),
        ErrorKind::SecurityRejected { messages } => format!(
            "{}. Only public http(s) URLs without credentials can be crawled; SEARCHPIPE_ALLOW_PRIVATE_HOSTS=true lifts the host check for trusted networks.",
            messages.join("; ")
        ),
        ErrorKind::NotImplemented => "This operation is not available on this backend.".to_string(),
    }
}

pub(crate) fn error_obj(err: &ApiError) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject<'a> {
        code: &'static str,
        message: &'a str,
        status: u16,
        retryable: bool,
        hint: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        details: Vec<String>,
    }

    let e = ErrorObject {
        code: err.code(),
        message: &err.message,
        status: err.status(),
        retryable: err.retryable(),
        hint: error_hint(err),
        details: err.details().to_vec(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": err.code(),
            "message": err.message,
            "status": err.status(),
            "retryable": err.retryable(),
        }),
    }
}

pub(crate) fn error_payload(
    kind: &str,
    request: serde_json::Value,
    err: &ApiError,
    elapsed_ms: u128,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "ok": false,
        "request": request,
        "error": error_obj(err),
    });
    add_envelope_fields(&mut payload, kind, elapsed_ms);
    payload
}

pub(crate) fn served_payload<T: Serialize>(
    kind: &str,
    request: serde_json::Value,
    served: &Served<T>,
) -> serde_json::Value {
    let data = serde_json::to_value(&served.value).unwrap_or(serde_json::Value::Null);
    let mut warnings: Vec<&'static str> = Vec::new();
    if served.source == ResponseSource::Cache {
        warnings.push("served_from_cache");
    }
    if data["results"].as_array().is_some_and(|a| a.is_empty()) {
        warnings.push("no_results");
    }
    if data["content"].as_str().is_some_and(|s| s.trim().is_empty()) {
        warnings.push("empty_content");
    }
    let mut payload = serde_json::json!({
        "ok": true,
        "source": served.source,
        "request": request,
        "data": data,
        "warnings": warnings,
        "warning_hints": warning_hints_from(&warnings),
    });
    add_envelope_fields(&mut payload, kind, served.elapsed_ms);
    payload
}

fn finish<T: Serialize>(
    kind: &str,
    request: serde_json::Value,
    out: Result<Served<T>>,
    t0: Instant,
) -> serde_json::Value {
    match out {
        Ok(served) => served_payload(kind, request, &served),
        Err(e) => {
            tracing::debug!(kind, code = e.code(), "tool call failed");
            error_payload(kind, request, &e, t0.elapsed().as_millis())
        }
    }
}

fn request_json<T: Serialize>(args: &T) -> serde_json::Value {
    serde_json::to_value(args).unwrap_or(serde_json::Value::Null)
}

fn client_of(slot: &ClientSlot) -> Result<&SearchClient> {
    slot.as_deref().map_err(Clone::clone)
}

// Arguments are validated before the client is consulted, so bad input is reported
// even when the server is not configured.

pub(crate) async fn search(slot: &ClientSlot, args: &QueryArgs) -> serde_json::Value {
    let t0 = Instant::now();
    let out: Result<Served<SearchResponse>> = async {
        let req = validate::search_request(args)?;
        client_of(slot)?.perform_search(&req).await
    }
    .await;
    finish("web_search", request_json(args), out, t0)
}

pub(crate) async fn news(slot: &ClientSlot, args: &QueryArgs) -> serde_json::Value {
    let t0 = Instant::now();
    let out: Result<Served<NewsResponse>> = async {
        let req = validate::news_request(args)?;
        client_of(slot)?.perform_news(&req).await
    }
    .await;
    finish("news_search", request_json(args), out, t0)
}

pub(crate) async fn crawl(slot: &ClientSlot, url: Option<&str>) -> serde_json::Value {
    let t0 = Instant::now();
    let allow_private = slot
        .as_ref()
        .map_or(false, |c| c.config().allow_private_hosts);
    let out: Result<Served<CrawlResponse>> = async {
        let req = validate::crawl_request(url, allow_private)?;
        client_of(slot)?.perform_crawl(&req).await
    }
    .await;
    finish("web_crawl", serde_json::json!({ "url": url }), out, t0)
}

pub(crate) fn stats(slot: &ClientSlot) -> serde_json::Value {
    let t0 = Instant::now();
    match client_of(slot) {
        Ok(c) => {
            let mut payload = serde_json::json!({ "ok": true, "stats": c.stats() });
            add_envelope_fields(&mut payload, "searchpipe_stats", t0.elapsed().as_millis());
            payload
        }
        Err(e) => error_payload("searchpipe_stats", serde_json::Value::Null, &e, 0),
    }
}

pub(crate) fn cache_stats(slot: &ClientSlot) -> serde_json::Value {
    let t0 = Instant::now();
    match client_of(slot) {
        Ok(c) => {
            let mut payload = serde_json::json!({ "ok": true, "cache": c.cache_stats() });
            add_envelope_fields(&mut payload, "searchpipe_cache_stats", t0.elapsed().as_millis());
            payload
        }
        Err(e) => error_payload("searchpipe_cache_stats", serde_json::Value::Null, &e, 0),
    }
}

pub(crate) async fn health(slot: &ClientSlot) -> serde_json::Value {
    let t0 = Instant::now();
    match client_of(slot) {
        Ok(c) => {
            let report = c.health_report().await;
            let mut payload = serde_json::json!({
                "ok": true,
                "status": report.status,
                "health": report,
            });
            add_envelope_fields(&mut payload, "searchpipe_health", t0.elapsed().as_millis());
            payload
        }
        Err(e) => error_payload("searchpipe_health", serde_json::Value::Null, &e, 0),
    }
}

pub(crate) fn cache_invalidate(slot: &ClientSlot, pattern: Option<&str>) -> serde_json::Value {
    let t0 = Instant::now();
    let pattern = pattern.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("*");
    let request = serde_json::json!({ "pattern": pattern });
    match client_of(slot) {
        Ok(c) => {
            let removed = c.invalidate(pattern);
            let mut payload = serde_json::json!({
                "ok": true,
                "request": request,
                "removed": removed,
            });
            add_envelope_fields(
                &mut payload,
                "searchpipe_cache_invalidate",
                t0.elapsed().as_millis(),
            );
            payload
        }
        Err(e) => error_payload("searchpipe_cache_invalidate", request, &e, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_limit_hint_names_the_reset_time() {
        let reset = now_epoch_s() + 30;
        let e = ApiError::rate_limited("slow down", Some(reset));
        let v = error_obj(&e);
        assert_eq!(v["code"], "RATE_LIMITED");
        assert_eq!(v["status"], 429);
        assert_eq!(v["retryable"], true);
        let hint = v["hint"].as_str().unwrap();
        assert!(hint.contains(&reset.to_string()), "{hint}");
    }

    #[test]
    fn validation_hint_lists_every_message() {
        let e = ApiError::validation(vec!["query must not be empty".into(), "bad max".into()]);
        let v = error_obj(&e);
        assert_eq!(v["retryable"], false);
        assert_eq!(v["details"].as_array().unwrap().len(), 2);
        let hint = v["hint"].as_str().unwrap();
        assert!(hint.contains("query must not be empty") && hint.contains("bad max"));
    }

    #[test]
    fn details_are_omitted_for_kinds_without_messages() {
        let v = error_obj(&ApiError::timeout(Duration::from_secs(1)));
        assert!(v.get("details").is_none());
        assert_eq!(v["status"], 408);
    }

    #[test]
    fn envelope_fields_are_always_present() {
        let mut p = serde_json::json!({ "ok": true });
        add_envelope_fields(&mut p, "x", 7);
        assert_eq!(p["schema_version"], SCHEMA_VERSION);
        assert_eq!(p["kind"], "x");
        assert_eq!(p["elapsed_ms"], 7);
        assert!(p["request"].is_null());
    }

    #[test]
    fn served_payload_reports_cache_and_empty_results() {
        let served = Served {
            value: SearchResponse::default(),
            source: ResponseSource::Cache,
            elapsed_ms: 1,
        };
        let p = served_payload("web_search", serde_json::json!({"query": "q"}), &served);
        assert_eq!(p["ok"], true);
        assert_eq!(p["source"], "cache");
        let w: Vec<&str> = p["warnings"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(w, vec!["served_from_cache", "no_results"]);
        assert!(p["warning_hints"]["no_results"].is_string());
    }

    #[tokio::test]
    async fn bad_arguments_win_over_missing_configuration() {
        let slot: ClientSlot = Err(ApiError::config(vec!["SEARCHPIPE_API_KEY is required".into()]));
        let p = search(&slot, &QueryArgs::default()).await;
        assert_eq!(p["error"]["code"], "VALIDATION_ERROR");

        let p = search(
            &slot,
            &QueryArgs {
                query: Some("rust".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(p["error"]["code"], "CONFIG_ERROR");
        assert!(p["error"]["hint"]
            .as_str()
            .unwrap()
            .contains("SEARCHPIPE_API_KEY"));
        assert_eq!(p["request"]["query"], "rust");
    }
}
