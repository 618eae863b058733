use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{should_retry, ApiError, ErrorKind, Result, RATE_LIMIT_RESET_HEADER};

/// One of the three upstream operations. Doubles as the cache-key prefix and the
/// performance-monitor operation name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    News,
    Crawl,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Search, Operation::News, Operation::Crawl];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::News => "news",
            Self::Crawl => "crawl",
        }
    }

    /// Upstream path, relative to the configured base URL.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Search => "/search",
            Self::News => "/news",
            Self::Crawl => "/crawl",
        }
    }

    /// Name under which network attempts are recorded by the performance monitor.
    pub fn metric_name(self) -> &'static str {
        match self {
            Self::Search => "api.search",
            Self::News => "api.news",
            Self::Crawl => "api.crawl",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" | "web_search" => Ok(Self::Search),
            "news" | "news_search" => Ok(Self::News),
            "crawl" | "web_crawl" => Ok(Self::Crawl),
            other => Err(ApiError::not_implemented(format!("operation {other:?}"))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: Option<usize>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub time_range: Option<TimeRange>,
    /// Restrict results to one site/domain, if the upstream supports it.
    pub site: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewsRequest {
    pub query: String,
    pub max_results: Option<usize>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrawlRequest {
    pub url: String,
}

impl CrawlRequest {
    pub fn parsed_url(&self) -> Result<url::Url> {
        url::Url::parse(self.url.trim())
            .map_err(|e| ApiError::validation(vec![format!("url is not valid: {e}")]))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(alias = "link")]
    pub url: String,
    #[serde(default, alias = "content", alias = "description")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsHit {
    #[serde(default)]
    pub title: String,
    #[serde(alias = "link")]
    pub url: String,
    #[serde(default, alias = "content", alias = "description")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "publishedAt", alias = "date")]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewsResponse {
    #[serde(default)]
    pub results: Vec<NewsHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrawlResponse {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
}

/// Upstream response envelope: `{success, message?, code?, data}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    pub data: Option<T>,
}

/// Ordinal health level. `Ord` follows severity so "worst of" is `max`, except that
/// `Unknown` sorts lowest: it only wins when nothing was measured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Served<T> {
    pub value: T,
    pub source: ResponseSource,
    pub elapsed_ms: u128,
}

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, req: &SearchRequest) -> Result<Served<SearchResponse>>;
    async fn news(&self, req: &NewsRequest) -> Result<Served<NewsResponse>>;
    async fn crawl(&self, req: &CrawlRequest) -> Result<Served<CrawlResponse>>;
}
