//! Local OAuth redirect listener.
//!
//! A [`CallbackServer`] serves the single browser redirect that carries the
//! authorization code. The background task and the waiter meet through a
//! [`CompletionSignal`], which resolves exactly once whether the redirect
//! arrives, the caller cancels, or both race.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// How a [`CompletionSignal`] wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome<T> {
    Completed(T),
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
enum Resolution<T> {
    Completed(T),
    Cancelled,
}

#[derive(Debug)]
struct SignalInner<T> {
    slot: Mutex<Option<Resolution<T>>>,
    notify: Notify,
}

/// One-shot completion shared between a producer and any number of waiters.
///
/// The first `complete` or `cancel` wins; later calls return `false` and
/// change nothing.
#[derive(Debug)]
pub struct CompletionSignal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for CompletionSignal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CompletionSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSignal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Resolution::Completed(value))
    }

    pub fn cancel(&self) -> bool {
        self.resolve(Resolution::Cancelled)
    }

    pub fn is_resolved(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn resolve(&self, resolution: Resolution<T>) -> bool {
        {
            let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(resolution);
        }
        self.inner.notify.notify_waiters();
        true
    }
}

impl<T: Clone> CompletionSignal<T> {
    fn peek(&self) -> Option<SignalOutcome<T>> {
        let slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|resolution| match resolution {
            Resolution::Completed(value) => SignalOutcome::Completed(value.clone()),
            Resolution::Cancelled => SignalOutcome::Cancelled,
        })
    }

    /// Waits until the signal resolves or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> SignalOutcome<T> {
        let resolved = async {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a resolve in between is not missed
                notified.as_mut().enable();
                if let Some(outcome) = self.peek() {
                    return outcome;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, resolved)
            .await
            .unwrap_or(SignalOutcome::TimedOut)
    }
}

/// Query parameters from the redirect request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackResult {
    fn from_url(url: &url::Url) -> Self {
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        Self {
            code: param("code"),
            state: param("state"),
            error: param("error"),
        }
    }

    fn is_success(&self) -> bool {
        self.error.is_none() && self.code.is_some()
    }

    /// Returns the authorization code after checking the error and state.
    ///
    /// # Errors
    /// Returns an error if the provider reported one, the state does not
    /// match `expected_state`, or no code was sent.
    pub fn into_code(self, expected_state: Option<&str>) -> Result<String> {
        if let Some(error) = self.error {
            bail!("Authorization failed: {error}");
        }
        if let Some(expected) = expected_state
            && self.state.as_deref() != Some(expected)
        {
            bail!("Authorization state mismatch");
        }
        self.code.context("Authorization redirect carried no code")
    }
}

/// Listens on `127.0.0.1` for one OAuth redirect.
#[derive(Debug)]
pub struct CallbackServer {
    port: u16,
    path: String,
    signal: CompletionSignal<CallbackResult>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Binds the listener and starts serving in the background. Port `0`
    /// picks a free port; see [`CallbackServer::port`].
    ///
    /// # Errors
    /// Returns an error if the port cannot be bound.
    pub async fn bind(port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind OAuth callback port {port}"))?;
        let port = listener.local_addr()?.port();
        let signal = CompletionSignal::new();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(serve(
            listener,
            path.to_string(),
            signal.clone(),
            shutdown.clone(),
        ));
        debug!(port, path, "OAuth callback listener started");

        Ok(Self {
            port,
            path: path.to_string(),
            signal,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        build_redirect_uri(self.port, &self.path)
    }

    /// Waits for the redirect. The listener stops once this returns.
    pub async fn wait(&self, timeout: Duration) -> SignalOutcome<CallbackResult> {
        let outcome = self.signal.wait(timeout).await;
        self.shutdown.cancel();
        outcome
    }

    /// Stops waiting. Safe to call any number of times, before or after the
    /// redirect arrives.
    pub fn cancel(&self) {
        self.signal.cancel();
        self.shutdown.cancel();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    path: String,
    signal: CompletionSignal<CallbackResult>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let mut stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "OAuth callback accept failed");
                signal.cancel();
                return;
            }
        };

        let Some(url) = read_request_url(&mut stream).await else {
            let _ = stream.write_all(http_response(400, FAILURE_PAGE).as_bytes()).await;
            continue;
        };
        // Browsers also ask for things like /favicon.ico
        if url.path() != path {
            let _ = stream.write_all(http_response(404, NOT_FOUND_PAGE).as_bytes()).await;
            continue;
        }

        let result = CallbackResult::from_url(&url);
        let page = if result.is_success() {
            http_response(200, SUCCESS_PAGE)
        } else {
            http_response(400, FAILURE_PAGE)
        };
        let _ = stream.write_all(page.as_bytes()).await;
        let _ = stream.shutdown().await;
        signal.complete(result);
        return;
    }
}

async fn read_request_url(stream: &mut TcpStream) -> Option<url::Url> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buffer.windows(4).any(|w| w == b"\r\n\r\n") && buffer.len() < MAX_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8_lossy(&buffer);
    let mut parts = request.lines().next()?.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    url::Url::parse(&format!("http://localhost{target}")).ok()
}

const SUCCESS_PAGE: &str =
    "<html><body><h3>Login complete</h3><p>You can close this window.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h3>Login failed</h3><p>Please return to the terminal and paste the code.</p></body></html>";
const NOT_FOUND_PAGE: &str = "<html><body><h3>Not found</h3></body></html>";

fn http_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Bad Request",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Builds the redirect URI for a localhost port.
pub fn build_redirect_uri(port: u16, path: &str) -> String {
    format!("http://localhost:{port}{path}")
}

/// Picks a random port in the dynamic range (49152..=65535).
pub fn random_local_port() -> u16 {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
    49152 + (raw % 16384)
}

/// Parses pasted authorization input into `(code, state)`.
///
/// Accepts a full redirect URL, a `code#state` pair, a `code=..&state=..`
/// query string, or a bare code.
pub fn parse_authorization_input(input: &str) -> (Option<String>, Option<String>) {
    let value = input.trim();
    if value.is_empty() {
        return (None, None);
    }

    if let Ok(url) = url::Url::parse(value) {
        let result = CallbackResult::from_url(&url);
        return (result.code, result.state);
    }

    if let Some((code, state)) = value.split_once('#') {
        return (Some(code.to_string()), Some(state.to_string()));
    }

    if value.contains("code=") {
        let params: Vec<_> = url::form_urlencoded::parse(value.as_bytes()).collect();
        let find = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_string())
        };
        return (find("code"), find("state"));
    }

    (Some(value.to_string()), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let signal = CompletionSignal::new();
        assert!(signal.complete("code"));
        assert!(!signal.cancel());
        assert!(!signal.complete("other"));
        assert_eq!(
            signal.wait(Duration::from_millis(10)).await,
            SignalOutcome::Completed("code")
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_wakes_waiter() {
        let signal: CompletionSignal<String> = CompletionSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert_eq!(waiter.await.unwrap(), SignalOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let signal: CompletionSignal<()> = CompletionSignal::new();
        assert_eq!(
            signal.wait(Duration::from_secs(120)).await,
            SignalOutcome::TimedOut
        );
        assert!(!signal.is_resolved());
    }

    #[tokio::test]
    async fn test_server_receives_code() {
        let server = CallbackServer::bind(0, "/oauth/callback").await.unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());
        assert_eq!(
            server.redirect_uri(),
            format!("http://localhost:{}/oauth/callback", server.port())
        );

        let client = reqwest::Client::new();
        let miss = client.get(format!("{base}/favicon.ico")).send().await.unwrap();
        assert_eq!(miss.status(), 404);

        let hit = client
            .get(format!("{base}/oauth/callback?code=abc%20123&state=xyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(hit.status(), 200);
        assert!(hit.text().await.unwrap().contains("Login complete"));

        let SignalOutcome::Completed(result) = server.wait(Duration::from_secs(5)).await else {
            panic!("expected a completed callback");
        };
        assert_eq!(result.code.as_deref(), Some("abc 123"));
        assert_eq!(result.clone().into_code(Some("xyz")).unwrap(), "abc 123");
        assert!(result.into_code(Some("other")).is_err());

        // Cancelling after completion changes nothing
        server.cancel();
        server.cancel();
        assert!(matches!(
            server.wait(Duration::from_millis(10)).await,
            SignalOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_server_reports_provider_error() {
        let server = CallbackServer::bind(0, "/cb").await.unwrap();
        let url = format!("http://127.0.0.1:{}/cb?error=access_denied", server.port());
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 400);

        let SignalOutcome::Completed(result) = server.wait(Duration::from_secs(5)).await else {
            panic!("expected a completed callback");
        };
        let err = result.into_code(None).unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_server_cancel() {
        let server = CallbackServer::bind(0, "/cb").await.unwrap();
        server.cancel();
        server.cancel();
        assert_eq!(
            server.wait(Duration::from_secs(5)).await,
            SignalOutcome::Cancelled
        );
    }

    #[test]
    fn test_parse_authorization_input() {
        assert_eq!(
            parse_authorization_input("http://localhost:1455/cb?code=c1&state=s1"),
            (Some("c1".to_string()), Some("s1".to_string()))
        );
        assert_eq!(
            parse_authorization_input(" c2#s2 "),
            (Some("c2".to_string()), Some("s2".to_string()))
        );
        assert_eq!(
            parse_authorization_input("code=c3&state=s3"),
            (Some("c3".to_string()), Some("s3".to_string()))
        );
        assert_eq!(
            parse_authorization_input("bare-code"),
            (Some("bare-code".to_string()), None)
        );
        assert_eq!(parse_authorization_input("  "), (None, None));
    }

    #[test]
    fn test_random_local_port_range() {
        for _ in 0..32 {
            assert!(random_local_port() >= 49152);
        }
    }
}
