//! Travis CI API integration for buildtime trend.
//!
//! Provides:
//! - Raw job log retrieval, bounded in size
//! - Build and job metadata lookup

use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::time::Duration;

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default request timeout for API calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const TRAVIS_ORG_API_URL: &str = "https://api.travis-ci.org/";
const TRAVIS_API_ACCEPT: &str = "application/vnd.travis-ci.2+json";
const LOG_ACCEPT: &str = "text/plain";
const CLIENT_USER_AGENT: &str = concat!("buildtime-trend/", env!("CARGO_PKG_VERSION"));

/// Travis API client errors.
#[derive(Debug, Error)]
pub enum TravisError {
    /// The configured API base URL is unusable.
    #[error("invalid API base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// API answered with a non-success status.
    #[error("{url} returned status {status}")]
    Status { status: StatusCode, url: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Travis CI API client.
///
/// Clones share the underlying HTTP connection pool.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a new client for the API at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not an absolute http(s) URL, or if the
    /// HTTP client fails to build.
    pub fn new(base_url: &str) -> Result<Self, TravisError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .map_err(TravisError::ClientBuild)?;

        Self::with_http(base_url, http)
    }

    /// Creates a client around an already configured HTTP client.
    pub fn with_http(base_url: &str, http: reqwest::Client) -> Result<Self, TravisError> {
        Ok(Self {
            http,
            base_url: parse_base_url(base_url)?,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn endpoint(&self, path: &str) -> Result<Url, TravisError> {
        self.base_url
            .join(path)
            .map_err(|err| TravisError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                reason: err.to_string(),
            })
    }

    /// URL of the raw log of a job: `<base>/jobs/<job_id>/log`.
    pub fn job_log_url(&self, job_id: &str) -> Result<Url, TravisError> {
        self.endpoint(&format!("jobs/{job_id}/log"))
    }

    /// Downloads the raw log of a job.
    ///
    /// The body is read chunk by chunk and kept up to one byte past
    /// `max_bytes`, so a parser limited to `max_bytes` sees the overrun. A
    /// connection that breaks off mid-body still yields the bytes received.
    pub async fn fetch_job_log(&self, job_id: &str, max_bytes: u64) -> Result<JobLog, TravisError> {
        let url = self.job_log_url(job_id)?;
        tracing::info!(%url, "requesting build job log");

        let mut response = self
            .http
            .get(url.clone())
            .header(ACCEPT, LOG_ACCEPT)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send()
            .await?;
        check_status(response.status(), &url)?;

        let keep = usize::try_from(max_bytes.saturating_add(1)).unwrap_or(usize::MAX);
        let mut log = JobLog::default();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = keep - log.body.len();
                    if chunk.len() >= room {
                        log.body.extend_from_slice(&chunk[..room]);
                        log.truncated = true;
                        tracing::warn!(job_id, limit = max_bytes, "job log exceeds size limit");
                        break;
                    }
                    log.body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        job_id,
                        bytes = log.body.len(),
                        error = %err,
                        "job log download interrupted"
                    );
                    log.interrupted = Some(TravisError::Request(err));
                    break;
                }
            }
        }

        tracing::debug!(job_id, bytes = log.body.len(), "downloaded build job log");
        Ok(log)
    }

    /// Looks up a build of `repo` (e.g. `buildtimetrend/python-lib`) by its
    /// build number.
    pub async fn build(&self, repo: &str, build_number: &str) -> Result<Option<BuildInfo>, TravisError> {
        let response: BuildsResponse = self
            .json_request(&format!("repos/{repo}/builds?number={build_number}"))
            .await?;
        Ok(response.builds.into_iter().next())
    }

    /// Looks up a single job.
    pub async fn job(&self, job_id: &str) -> Result<JobInfo, TravisError> {
        let response: JobResponse = self.json_request(&format!("jobs/{job_id}")).await?;
        Ok(response.job)
    }

    async fn json_request<T: DeserializeOwned>(&self, path: &str) -> Result<T, TravisError> {
        let url = self.endpoint(path)?;
        tracing::debug!(%url, "travis API request");

        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, TRAVIS_API_ACCEPT)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send()
            .await?;
        check_status(response.status(), &url)?;

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|err| TravisError::InvalidResponse(err.to_string()))
    }
}

fn check_status(status: StatusCode, url: &Url) -> Result<(), TravisError> {
    if status.is_success() {
        return Ok(());
    }
    Err(TravisError::Status {
        status,
        url: url.to_string(),
    })
}

fn parse_base_url(raw: &str) -> Result<Url, TravisError> {
    let invalid = |reason: String| TravisError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot be a base".to_string()));
    }

    // `Url::join` replaces the last path segment unless the path ends in '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// A downloaded job log.
#[derive(Debug, Default)]
pub struct JobLog {
    body: Vec<u8>,
    truncated: bool,
    interrupted: Option<TravisError>,
}

impl JobLog {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The server sent more than the size limit; the rest was not read.
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Why the download stopped before the end of the body, if it did.
    pub const fn interruption(&self) -> Option<&TravisError> {
        self.interrupted.as_ref()
    }

    /// Reads the received bytes, then fails with the interruption if the
    /// download broke off.
    pub fn into_reader(self) -> impl BufRead + Send {
        let tail = Interruption(self.interrupted.map(io::Error::other));
        BufReader::new(Cursor::new(self.body).chain(tail))
    }
}

/// Yields its error once, then end of stream.
struct Interruption(Option<io::Error>);

impl Read for Interruption {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        self.0.take().map_or(Ok(0), Err)
    }
}

/// A build as returned by `repos/<repo>/builds`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildInfo {
    pub id: u64,
    pub number: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub job_ids: Vec<u64>,
}

/// A job as returned by `jobs/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobInfo {
    pub id: u64,
    #[serde(default)]
    pub build_id: Option<u64>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub repository_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    #[serde(default)]
    builds: Vec<BuildInfo>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job: JobInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use btt_core::{LogParser, ParseError, ParseOptions, StopReason};

    /// Writes `response` to the first connection and returns the raw request.
    fn serve_raw(response: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let _ = stream.write_all(response.as_bytes());
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}/"), handle)
    }

    fn serve_once(status: &str, body: &str) -> (String, thread::JoinHandle<String>) {
        serve_raw(format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ))
    }

    const TIMED_BLOCK: &str = "travis_time:start:a1\r\x1b[0K$ make\r\n\
                               travis_time:end:a1:start=1,finish=3,duration=2\r\x1b[0K\n";

    fn local_client(base_url: &str) -> Client {
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        Client::with_http(base_url, http).unwrap()
    }

    #[test]
    fn client_accepts_default_api_url() {
        let client = Client::new(TRAVIS_ORG_API_URL).unwrap();
        assert_eq!(client.base_url(), "https://api.travis-ci.org/");
    }

    #[test]
    fn client_rejects_invalid_base_url() {
        assert!(matches!(
            Client::new("not a url"),
            Err(TravisError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            Client::new("ftp://example.com/"),
            Err(TravisError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = Client::new("https://travis.example.com/api").unwrap();
        assert_eq!(
            client.job_log_url("42").unwrap().as_str(),
            "https://travis.example.com/api/jobs/42/log"
        );
    }

    #[test]
    fn job_log_url_format() {
        let client = Client::new(TRAVIS_ORG_API_URL).unwrap();
        assert_eq!(
            client.job_log_url("158").unwrap().as_str(),
            "https://api.travis-ci.org/jobs/158/log"
        );
    }

    #[test]
    fn client_debug_shows_base_url() {
        let client = Client::new(TRAVIS_ORG_API_URL).unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("api.travis-ci.org"));
    }

    #[tokio::test]
    async fn fetch_job_log_returns_body() {
        let (base, server) = serve_once("200 OK", "travis_time:start:abc\r\x1b[0K\n");
        let client = local_client(&base);

        let log = client.fetch_job_log("123", 1024).await.unwrap();
        assert_eq!(log.body(), b"travis_time:start:abc\r\x1b[0K\n");
        assert!(!log.is_truncated());
        assert!(log.interruption().is_none());

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /jobs/123/log HTTP/1.1"));
        assert!(request.to_lowercase().contains("user-agent: buildtime-trend/"));
    }

    #[tokio::test]
    async fn oversized_log_stops_at_size_limit() {
        let body = format!("{TIMED_BLOCK}{}\n", "x".repeat(200));
        let (base, server) = serve_once("200 OK", &body);
        let client = local_client(&base);

        let log = client.fetch_job_log("123", 100).await.unwrap();
        assert!(log.is_truncated());
        assert_eq!(log.body().len(), 101);

        let options = ParseOptions {
            max_total_bytes: 100,
            ..ParseOptions::default()
        };
        let outcome = LogParser::new(options).parse(log.into_reader()).unwrap();
        assert_eq!(outcome.stop, StopReason::SizeLimit);
        assert_eq!(outcome.substages.len(), 1);
        assert_eq!(outcome.substages[0].duration, 2);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_keeps_received_substages() {
        let body = format!("{TIMED_BLOCK}travis_time:start:a2\r\x1b[0K$ make test\r\n");
        let (base, server) = serve_raw(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len() + 500
        ));
        let client = local_client(&base);

        let log = client.fetch_job_log("7", 1024 * 1024).await.unwrap();
        server.join().unwrap();
        assert!(matches!(log.interruption(), Some(TravisError::Request(_))));
        assert_eq!(log.body(), body.as_bytes());

        let err = LogParser::default().parse(log.into_reader()).unwrap_err();
        let ParseError::Source { partial, .. } = err else {
            panic!("expected source error");
        };
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].command, "make");
    }

    #[test]
    fn complete_log_reader_ends_cleanly() {
        let log = JobLog {
            body: b"line\n".to_vec(),
            ..JobLog::default()
        };
        let mut text = String::new();
        log.into_reader().read_to_string(&mut text).unwrap();
        assert_eq!(text, "line\n");
    }

    #[tokio::test]
    async fn fetch_job_log_reports_http_status() {
        let (base, server) = serve_once("404 Not Found", "not found");
        let client = local_client(&base);

        let err = client.fetch_job_log("9", 1024).await.unwrap_err();
        assert!(matches!(
            err,
            TravisError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn build_lookup_parses_job_ids() {
        let body = r#"{"builds":[{"id":4321,"number":"158","state":"passed","started_at":"2014-12-15T17:40:00Z","finished_at":"2014-12-15T17:45:00Z","duration":300,"job_ids":[11,12]}],"commits":[]}"#;
        let (base, server) = serve_once("200 OK", body);
        let client = local_client(&base);

        let build = client
            .build("buildtimetrend/python-lib", "158")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(build.id, 4321);
        assert_eq!(build.job_ids, vec![11, 12]);
        assert_eq!(build.state.as_deref(), Some("passed"));

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /repos/buildtimetrend/python-lib/builds?number=158 "));
        assert!(request.contains("application/vnd.travis-ci.2+json"));
    }

    #[tokio::test]
    async fn build_lookup_without_match_is_none() {
        let (base, server) = serve_once("200 OK", r#"{"builds":[]}"#);
        let client = local_client(&base);

        assert!(client.build("a/b", "1").await.unwrap().is_none());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn job_lookup_rejects_invalid_json() {
        let (base, server) = serve_once("200 OK", "not-json");
        let client = local_client(&base);

        let err = client.job("1").await.unwrap_err();
        assert!(matches!(err, TravisError::InvalidResponse(_)));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn job_lookup_parses_job() {
        let body = r#"{"job":{"id":11,"build_id":4321,"number":"158.1","state":"failed","repository_slug":"buildtimetrend/python-lib"}}"#;
        let (base, server) = serve_once("200 OK", body);
        let client = local_client(&base);

        let job = client.job("11").await.unwrap();
        assert_eq!(job.number.as_deref(), Some("158.1"));
        assert_eq!(job.build_id, Some(4321));
        assert_eq!(
            job.repository_slug.as_deref(),
            Some("buildtimetrend/python-lib")
        );
        server.join().unwrap();
    }
}
