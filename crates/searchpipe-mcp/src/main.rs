use anyhow::Result;
use clap::{Parser, Subcommand};
use searchpipe_local::validate::QueryArgs;
use searchpipe_local::ClientConfig;

mod payload;

#[derive(Parser, Debug)]
#[command(name = "searchpipe")]
#[command(about = "Cached, retrying search/news/crawl client (CLI + MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Run one web search and print the JSON payload.
    Search(SearchCmd),
    /// Run one news search and print the JSON payload.
    News(NewsCmd),
    /// Crawl one URL and print the JSON payload.
    Crawl(CrawlCmd),
    /// Run every health probe once and print the report.
    Health(HealthCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    /// Search query.
    query: String,
    /// Number of results (1..=50).
    #[arg(long)]
    max_results: Option<i64>,
    /// Result language, e.g. "en" or "en-US".
    #[arg(long)]
    language: Option<String>,
    /// Country code, e.g. "us".
    #[arg(long)]
    country: Option<String>,
    /// Recency filter. Allowed: day, week, month, year
    #[arg(long)]
    time_range: Option<String>,
    /// Restrict results to one domain.
    #[arg(long)]
    site: Option<String>,
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct NewsCmd {
    /// News query.
    query: String,
    #[arg(long)]
    max_results: Option<i64>,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    country: Option<String>,
    /// Recency filter. Allowed: day, week, month, year
    #[arg(long)]
    time_range: Option<String>,
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct CrawlCmd {
    /// Page URL (http or https).
    url: String,
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct HealthCmd {
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
    /// Spawn `searchpipe mcp-stdio` and perform a list_tools handshake.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    check_stdio: bool,
    /// Timeout for the stdio handshake.
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format. Allowed: json, text
    #[arg(long, default_value = "json")]
    output: String,
}

impl From<SearchCmd> for QueryArgs {
    fn from(c: SearchCmd) -> Self {
        QueryArgs {
            query: Some(c.query),
            max_results: c.max_results,
            language: c.language,
            country: c.country,
            time_range: c.time_range,
            site: c.site,
        }
    }
}

impl From<NewsCmd> for QueryArgs {
    fn from(c: NewsCmd) -> Self {
        QueryArgs {
            query: Some(c.query),
            max_results: c.max_results,
            language: c.language,
            country: c.country,
            time_range: c.time_range,
            site: None,
        }
    }
}

#[cfg(feature = "stdio")]
mod mcp {
    use crate::payload::{self, ClientSlot};
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, ServiceExt,
    };
    use schemars::JsonSchema;
    use searchpipe_local::validate::QueryArgs;
    use serde::Deserialize;

    fn tool_result(payload: serde_json::Value) -> CallToolResult {
        // Structured content for machine consumers, plus a text copy for clients that
        // only read `content[0].text`.
        let mut r = CallToolResult::structured(payload.clone());
        r.content = vec![Content::text(payload.to_string())];
        r
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct EmptyArgs {}

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebSearchArgs {
        /// Search query (required, at most 500 characters).
        #[serde(default)]
        query: Option<String>,
        /// Number of results, 1..=50 (upstream default: 10).
        #[serde(default)]
        max_results: Option<i64>,
        /// Result language, e.g. "en" or "en-US".
        #[serde(default)]
        language: Option<String>,
        /// Country code, e.g. "us".
        #[serde(default)]
        country: Option<String>,
        /// Recency filter. Allowed: day, week, month, year
        #[serde(default)]
        time_range: Option<String>,
        /// Restrict results to one domain, e.g. "docs.rs".
        #[serde(default)]
        site: Option<String>,
    }

    impl From<WebSearchArgs> for QueryArgs {
        fn from(a: WebSearchArgs) -> Self {
            QueryArgs {
                query: a.query,
                max_results: a.max_results,
                language: a.language,
                country: a.country,
                time_range: a.time_range,
                site: a.site,
            }
        }
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct NewsSearchArgs {
        /// News query (required, at most 500 characters).
        #[serde(default)]
        query: Option<String>,
        /// Number of results, 1..=50.
        #[serde(default)]
        max_results: Option<i64>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        country: Option<String>,
        /// Recency filter. Allowed: day, week, month, year
        #[serde(default)]
        time_range: Option<String>,
    }

    impl From<NewsSearchArgs> for QueryArgs {
        fn from(a: NewsSearchArgs) -> Self {
            QueryArgs {
                query: a.query,
                max_results: a.max_results,
                language: a.language,
                country: a.country,
                time_range: a.time_range,
                site: None,
            }
        }
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebCrawlArgs {
        /// Page URL (required). Must be public http(s) without embedded credentials.
        #[serde(default)]
        url: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct CacheInvalidateArgs {
        /// Key prefix to drop, e.g. "search:" or "news:*". Default "*" (everything).
        #[serde(default)]
        pattern: Option<String>,
    }

    #[derive(Clone)]
    pub(crate) struct SearchpipeMcp {
        tool_router: RmcpToolRouter<Self>,
        client: ClientSlot,
    }

    #[tool_router]
    impl SearchpipeMcp {
        pub(crate) fn new() -> Self {
            let client = payload::client_from_env();
            if let Err(e) = &client {
                tracing::warn!(error = %e, "searchpipe is not configured; calls will return CONFIG_ERROR");
            }
            Self::with_client(client)
        }

        pub(crate) fn with_client(client: ClientSlot) -> Self {
            Self {
                tool_router: Self::tool_router(),
                client,
            }
        }

        #[tool(
            description = "Web search through the configured upstream. Cached per argument set; returns {ok, source, data:{results:[{title,url,snippet}]}} or {ok:false, error}."
        )]
        async fn web_search(
            &self,
            params: Parameters<Option<WebSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args: QueryArgs = params.0.unwrap_or_default().into();
            Ok(tool_result(payload::search(&self.client, &args).await))
        }

        #[tool(
            description = "News search. Same arguments as web_search except site. Returns results with source and published_at when known."
        )]
        async fn news_search(
            &self,
            params: Parameters<Option<NewsSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args: QueryArgs = params.0.unwrap_or_default().into();
            Ok(tool_result(payload::news(&self.client, &args).await))
        }

        #[tool(
            description = "Crawl one public page and return its title and text content. Private, loopback and link-local hosts are rejected."
        )]
        async fn web_crawl(
            &self,
            params: Parameters<Option<WebCrawlArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            Ok(tool_result(
                payload::crawl(&self.client, args.url.as_deref()).await,
            ))
        }

        #[tool(
            description = "Performance summary (per-operation latency percentiles, error rates, recent alerts) plus cache statistics."
        )]
        async fn searchpipe_stats(
            &self,
            params: Parameters<Option<EmptyArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let _ = params;
            Ok(tool_result(payload::stats(&self.client)))
        }

        #[tool(description = "Cache statistics: hits, misses, evictions, size and hit ratio.")]
        async fn searchpipe_cache_stats(
            &self,
            params: Parameters<Option<EmptyArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let _ = params;
            Ok(tool_result(payload::cache_stats(&self.client)))
        }

        #[tool(description = "Run every health probe now and return the aggregated report.")]
        async fn searchpipe_health(
            &self,
            params: Parameters<Option<EmptyArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let _ = params;
            Ok(tool_result(payload::health(&self.client).await))
        }

        #[tool(description = "Drop cached responses whose key starts with pattern (default: all).")]
        async fn searchpipe_cache_invalidate(
            &self,
            params: Parameters<Option<CacheInvalidateArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            Ok(tool_result(payload::cache_invalidate(
                &self.client,
                args.pattern.as_deref(),
            )))
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for SearchpipeMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Search, news and crawl through one upstream API with caching, retries and health reporting. Outputs are JSON and schema-versioned."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio() -> Result<(), McpError> {
        let svc = SearchpipeMcp::new();
        if let Ok(c) = &svc.client {
            c.start_background();
        }
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        tracing::info!("mcp stdio session closed");
        Ok(())
    }

    pub(crate) const TOOL_NAMES: [&str; 7] = [
        "web_search",
        "news_search",
        "web_crawl",
        "searchpipe_stats",
        "searchpipe_cache_stats",
        "searchpipe_health",
        "searchpipe_cache_invalidate",
    ];

    /// Spawn `searchpipe mcp-stdio`, list its tools and compare them with ours.
    /// Spawn, handshake and timeout failures all come back as a failed check.
    pub(crate) async fn stdio_handshake_check(timeout_ms: u64) -> serde_json::Value {
        use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};

        let t0 = std::time::Instant::now();
        let listed = async {
            let exe = std::env::current_exe()?;
            let child = TokioChildProcess::new(tokio::process::Command::new(exe).configure(|cmd| {
                cmd.arg("mcp-stdio");
                cmd.env("SEARCHPIPE_LOG", "error");
            }))?;
            let service = ().serve(child).await?;
            let tools = service.list_tools(Default::default()).await;
            let _ = service.cancel().await;
            Ok::<_, anyhow::Error>(
                tools?
                    .tools
                    .into_iter()
                    .map(|t| t.name.to_string())
                    .collect::<Vec<_>>(),
            )
        };
        let out = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), listed).await;
        let elapsed_ms = t0.elapsed().as_millis();
        match out {
            Ok(Ok(names)) => {
                let missing: Vec<&str> = TOOL_NAMES
                    .iter()
                    .copied()
                    .filter(|n| !names.iter().any(|x| x == n))
                    .collect();
                serde_json::json!({
                    "name": "mcp_stdio_handshake",
                    "ok": missing.is_empty(),
                    "skipped": false,
                    "message": if missing.is_empty() {
                        "stdio MCP handshake succeeded"
                    } else {
                        "stdio MCP server is missing tools"
                    },
                    "tool_count": names.len(),
                    "missing_tools": missing,
                    "elapsed_ms": elapsed_ms,
                })
            }
            Ok(Err(e)) => serde_json::json!({
                "name": "mcp_stdio_handshake",
                "ok": false,
                "skipped": false,
                "message": format!("stdio MCP handshake failed: {e}"),
                "hint": "Nothing but MCP frames may be written to stdout in mcp-stdio mode.",
                "elapsed_ms": elapsed_ms,
            }),
            Err(_) => serde_json::json!({
                "name": "mcp_stdio_handshake",
                "ok": false,
                "skipped": false,
                "message": format!("stdio MCP handshake timed out after {timeout_ms}ms"),
                "elapsed_ms": elapsed_ms,
            }),
        }
    }

}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // Logs go to stderr: stdout carries the MCP transport and one-shot JSON.
    let filter = std::env::var("SEARCHPIPE_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Load `KEY=value` lines from `SEARCHPIPE_ENV_FILE` without overriding the
/// process environment. Values are never logged.
fn load_env_file() {
    let Ok(p) = std::env::var("SEARCHPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// Print a one-shot payload and turn `ok:false` into a failing exit status.
fn emit(
    payload: &serde_json::Value,
    output: &str,
    text: impl FnOnce(&serde_json::Value),
) -> Result<()> {
    match output.to_ascii_lowercase().as_str() {
        "text" if payload["ok"].as_bool() == Some(true) => text(payload),
        _ => println!("{payload}"),
    }
    if payload["ok"].as_bool() == Some(true) {
        Ok(())
    } else {
        anyhow::bail!(
            "{}: {}",
            payload["error"]["code"].as_str().unwrap_or("ERROR"),
            payload["error"]["message"].as_str().unwrap_or("")
        )
    }
}

fn print_hits(payload: &serde_json::Value) {
    if let Some(arr) = payload["data"]["results"].as_array() {
        for (i, hit) in arr.iter().enumerate() {
            println!(
                "{}. {}\n   {}",
                i + 1,
                hit["title"].as_str().unwrap_or(""),
                hit["url"].as_str().unwrap_or("")
            );
        }
    }
}

#[cfg(feature = "stdio")]
async fn stdio_check(timeout_ms: u64) -> serde_json::Value {
    mcp::stdio_handshake_check(timeout_ms).await
}

#[cfg(not(feature = "stdio"))]
async fn stdio_check(_timeout_ms: u64) -> serde_json::Value {
    serde_json::json!({
        "name": "mcp_stdio_handshake",
        "ok": false,
        "skipped": false,
        "message": "built without the stdio feature",
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Search(args) => {
            let output = args.output.clone();
            let slot = payload::client_from_env();
            let v = payload::search(&slot, &QueryArgs::from(args)).await;
            emit(&v, &output, print_hits)?;
        }
        Commands::News(args) => {
            let output = args.output.clone();
            let slot = payload::client_from_env();
            let v = payload::news(&slot, &QueryArgs::from(args)).await;
            emit(&v, &output, print_hits)?;
        }
        Commands::Crawl(args) => {
            let slot = payload::client_from_env();
            let v = payload::crawl(&slot, Some(args.url.as_str())).await;
            emit(&v, &args.output, |v| {
                if let Some(t) = v["data"]["title"].as_str() {
                    println!("# {t}\n");
                }
                println!("{}", v["data"]["content"].as_str().unwrap_or(""));
            })?;
        }
        Commands::Health(args) => {
            let slot = payload::client_from_env();
            let v = payload::health(&slot).await;
            emit(&v, &args.output, |v| {
                println!("status: {}", v["status"].as_str().unwrap_or("unknown"));
                if let Some(arr) = v["health"]["components"].as_array() {
                    for c in arr {
                        println!(
                            "- {}: {} {}",
                            c["name"].as_str().unwrap_or("?"),
                            c["status"].as_str().unwrap_or("?"),
                            c["message"].as_str().unwrap_or("")
                        );
                    }
                }
            })?;
        }
        Commands::Doctor(args) => {
            let t0 = std::time::Instant::now();
            let mut checks: Vec<serde_json::Value> = Vec::new();

            // Presence and shape only; the API key itself is never printed.
            let config = ClientConfig::from_env();
            let configured = match &config {
                Ok(c) => c.redacted(),
                Err(_) => serde_json::json!({
                    "api_key_present": std::env::var(searchpipe_local::config::ENV_API_KEY)
                        .or_else(|_| std::env::var(searchpipe_local::config::ENV_API_KEY_ALIAS))
                        .is_ok_and(|v| !v.trim().is_empty()),
                }),
            };
            checks.push(serde_json::json!({
                "name": "config_valid",
                "ok": config.is_ok(),
                "message": if config.is_ok() { "configuration is valid" } else { "configuration is invalid" },
                "problems": config.as_ref().err().map(|e| e.details().to_vec()).unwrap_or_default(),
                "hint": if config.is_ok() {
                    ""
                } else {
                    "Set SEARCHPIPE_API_KEY (and optionally SEARCHPIPE_BASE_URL) in the server env, or point SEARCHPIPE_ENV_FILE at a KEY=value file."
                },
            }));

            checks.push(if args.check_stdio {
                stdio_check(args.timeout_ms).await
            } else {
                serde_json::json!({
                    "name": "mcp_stdio_handshake",
                    "ok": true,
                    "skipped": true,
                    "message": "stdio MCP handshake skipped",
                })
            });

            let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
            let payload = serde_json::json!({
                "schema_version": payload::SCHEMA_VERSION,
                "kind": "doctor",
                "ok": ok,
                "name": "searchpipe",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": {
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                },
                "features": {
                    "stdio": cfg!(feature = "stdio"),
                },
                "elapsed_ms": t0.elapsed().as_millis(),
                "configured": configured,
                "checks": checks,
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!("searchpipe {} (ok={})", env!("CARGO_PKG_VERSION"), ok);
                    println!(
                        "api_key_present: {}",
                        payload["configured"]["api_key_present"]
                            .as_bool()
                            .unwrap_or(false)
                    );
                    println!("checks:");
                    if let Some(arr) = payload["checks"].as_array() {
                        for c in arr {
                            let name = c["name"].as_str().unwrap_or("?");
                            let ok = c["ok"].as_bool().unwrap_or(false);
                            let skipped = c["skipped"].as_bool().unwrap_or(false);
                            if skipped {
                                println!("- {}: skipped", name);
                            } else {
                                println!("- {}: {}", name, if ok { "ok" } else { "fail" });
                            }
                        }
                    }
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": payload::SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "searchpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("searchpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }

    Ok(())
}
