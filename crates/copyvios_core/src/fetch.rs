use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use reqwest::blocking::Client;
use tracing::debug;

use crate::config::{CopyvioConfig, ProxyConfig};
use crate::error::FetchError;
use crate::parsers::{content_charset, normalize_content_type};

/// Hard cap on any response body, whatever its content type.
pub const MAX_RAW_SIZE: usize = 20 * 1024 * 1024;

pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub timeout: Duration,
    /// Maximum body size for a normalized content type; `None` rejects the type.
    pub size_limit: &'a (dyn Fn(&str) -> Option<usize> + Sync),
}

#[derive(Debug, Clone)]
pub struct FetchedContent {
    /// Final URL after HTTP redirects.
    pub url: String,
    pub content_type: String,
    /// `charset` parameter of the `Content-Type` header.
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedContent, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    proxies: Vec<ProxyConfig>,
}

impl HttpFetcher {
    pub fn new(proxies: Vec<ProxyConfig>) -> Result<Self> {
        let client = Client::builder()
            .gzip(true)
            .cookie_store(true)
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self { client, proxies })
    }

    pub fn from_config(config: &CopyvioConfig) -> Result<Self> {
        Self::new(config.search.proxies.clone())
    }

    fn proxy_for(&self, url: &Url) -> Option<&ProxyConfig> {
        let host = url.host_str()?;
        self.proxies.iter().find(|proxy| {
            proxy.netloc.eq_ignore_ascii_case(host)
                && proxy
                    .path
                    .as_deref()
                    .is_none_or(|prefix| url.path().starts_with(prefix))
        })
    }

    fn fetch_url(
        &self,
        url: &str,
        auth: Option<&str>,
        request: &FetchRequest<'_>,
    ) -> Result<FetchedContent, FetchError> {
        let mut builder = self.client.get(url).timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = auth {
            let (user, password) = auth.split_once(':').unwrap_or((auth, ""));
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder
            .send()
            .map_err(|error| FetchError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let header = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let content_type = normalize_content_type(header);
        let charset = content_charset(header);
        let limit = (request.size_limit)(&content_type)
            .ok_or_else(|| FetchError::UnsupportedContentType(content_type.clone()))?
            .min(MAX_RAW_SIZE) as u64;
        if let Some(length) = response.content_length() {
            if length > limit {
                return Err(FetchError::TooLarge {
                    size: length,
                    limit,
                });
            }
        }

        let mut body = Vec::new();
        response
            .take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|error| FetchError::Body(error.to_string()))?;
        if body.len() as u64 > limit {
            return Err(FetchError::TooLarge {
                size: body.len() as u64,
                limit,
            });
        }

        Ok(FetchedContent {
            url: final_url,
            content_type,
            charset,
            body,
        })
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedContent, FetchError> {
        let url = Url::parse(request.url)
            .map_err(|error| FetchError::Transport(format!("invalid URL {}: {error}", request.url)))?;
        let Some(proxy) = self.proxy_for(&url) else {
            return self.fetch_url(request.url, None, request);
        };

        let proxied = proxied_url(proxy, &url);
        if !proxy.onerr {
            debug!(url = request.url, proxied, "fetching through proxy");
            return self.fetch_url(&proxied, proxy.auth.as_deref(), request);
        }
        match self.fetch_url(request.url, None, request) {
            Err(error @ (FetchError::Transport(_) | FetchError::Status(_))) => {
                debug!(url = request.url, %error, proxied, "direct fetch failed, retrying through proxy");
                self.fetch_url(&proxied, proxy.auth.as_deref(), request)
            }
            other => other,
        }
    }
}

/// Rewrite `url` onto the proxy target, dropping the matched path prefix.
fn proxied_url(proxy: &ProxyConfig, url: &Url) -> String {
    let path = url.path();
    let rest = proxy
        .path
        .as_deref()
        .and_then(|prefix| path.strip_prefix(prefix))
        .unwrap_or(path);
    let mut rewritten = format!(
        "{}/{}",
        proxy.target.trim_end_matches('/'),
        rest.trim_start_matches('/')
    );
    if let Some(query) = url.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    rewritten
}
