//! JSON over HTTP.
//!
//! A request is described by [`get`] and turned into a command by [`send`].
//! The outcome always comes back as one message built from a
//! `Result<T, HttpError>`, whether the fetch succeeded or not:
//!
//! ```rust,ignore
//! let request = http::get(url, |json: Value| {
//!     json["data"]["image_url"].as_str().map(str::to_owned).ok_or("no image url")
//! });
//! Next::with(model, http::send(request, Msg::NewGif))
//! ```

use realm_core::{
    downcast_payload, Command, CommandHandler, CommandPayload, CommandTag, Completion, Dispatcher,
    EffectError, Payload,
};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Tag of the HTTP send command.
pub const SEND: CommandTag = CommandTag::new("http.send");

/// Why an HTTP command did not produce a value. Delivered to `update` as the
/// error half of the response message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The request could not be sent or the response never arrived.
    #[error("request to {url} failed: {reason}")]
    Network {
        /// Requested URL.
        url: String,
        /// Transport error.
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("{url} answered with status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The body is not valid JSON.
    #[error("response from {url} is not valid JSON: {reason}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Parser error.
        reason: String,
    },

    /// The caller's transform rejected the JSON body or panicked on it.
    #[error("response from {url} was rejected: {reason}")]
    Transform {
        /// Requested URL.
        url: String,
        /// Error returned by the transform.
        reason: String,
    },
}

type Transform<T> = Box<dyn FnOnce(Value) -> Result<T, String> + Send>;

/// A GET request whose JSON body is mapped to `T`.
pub struct Request<T> {
    url: String,
    transform: Transform<T>,
}

impl<T> Request<T> {
    /// The requested URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("url", &self.url).finish()
    }
}

/// Describe a GET of `url` whose JSON body is passed through `transform`.
///
/// A transform that panics is reported as [`HttpError::Transform`].
pub fn get<T, E>(
    url: impl Into<String>,
    transform: impl FnOnce(Value) -> Result<T, E> + Send + 'static,
) -> Request<T>
where
    T: 'static,
    E: fmt::Display + 'static,
{
    Request {
        url: url.into(),
        transform: Box::new(move |json| {
            match catch_unwind(AssertUnwindSafe(move || transform(json))) {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(panic) => Err(format!("transform panicked: {}", panic_message(panic.as_ref()))),
            }
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Payload of [`SEND`].
pub struct HttpSend<Msg> {
    /// Requested URL.
    pub url: String,
    respond: Box<dyn FnOnce(Result<Value, HttpError>) -> Msg + Send>,
}

impl<Msg: Send + 'static> CommandPayload<Msg> for HttpSend<Msg> {
    const TAG: CommandTag = SEND;
}

/// Perform `request` and dispatch `to_msg` with its outcome.
pub fn send<T, Msg>(
    request: Request<T>,
    to_msg: impl FnOnce(Result<T, HttpError>) -> Msg + Send + 'static,
) -> Command<Msg>
where
    T: 'static,
    Msg: Send + 'static,
{
    let Request { url, transform } = request;
    let requested = url.clone();
    Command::effect(HttpSend {
        url,
        respond: Box::new(move |body: Result<Value, HttpError>| {
            to_msg(body.and_then(|json| {
                transform(json).map_err(|reason| HttpError::Transform {
                    url: requested,
                    reason,
                })
            }))
        }),
    })
}

/// Handler for [`SEND`], backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    /// A handler with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler using a preconfigured client (timeouts, proxies, headers).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl<Msg: Send + 'static> CommandHandler<Msg> for HttpHandler {
    fn handle(&self, payload: Payload, dispatch: &Dispatcher<Msg>) -> Result<Completion, EffectError> {
        let HttpSend { url, respond } = downcast_payload::<HttpSend<Msg>>(SEND, payload)?;
        let client = self.client.clone();
        let dispatch = dispatch.clone();
        Ok(Completion::pending(async move {
            let body = fetch(&client, &url).await;
            if let Err(e) = &body {
                tracing::warn!(url = %url, error = %e, "http request failed");
            }
            dispatch.dispatch(respond(body));
        }))
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Value, HttpError> {
    tracing::debug!(url, "GET");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| HttpError::Network {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(HttpError::Status {
            url: url.to_owned(),
            status: status.as_u16(),
        });
    }

    response.json::<Value>().await.map_err(|e| HttpError::Decode {
        url: url.to_owned(),
        reason: e.to_string(),
    })
}
