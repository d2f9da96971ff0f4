use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::config::CopyvioConfig;
use crate::error::{EngineError, SearchQueryError};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One web search API. Implementations return result URLs in ranking order.
pub trait SearchEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn search(&self, query: &str) -> Result<Vec<String>, SearchQueryError>;
}

/// Build the engine named by the config. Names are matched case-insensitively.
pub fn get_search_engine(
    config: &CopyvioConfig,
    headers: &[(String, String)],
) -> Result<Box<dyn SearchEngine>, EngineError> {
    let name = config.engine().unwrap_or_default();
    let credentials = &config.search.credentials;
    let count = config.result_count();
    match name.trim().to_ascii_lowercase().as_str() {
        "bing" => Ok(Box::new(BingSearchEngine::new(credentials, headers, count)?)),
        "google" => Ok(Box::new(GoogleSearchEngine::new(credentials, headers, count)?)),
        "yandex" => yandex_engine(credentials, headers, count),
        _ => Err(EngineError::Unknown(name)),
    }
}

#[cfg(feature = "yandex")]
fn yandex_engine(
    credentials: &BTreeMap<String, String>,
    headers: &[(String, String)],
    count: usize,
) -> Result<Box<dyn SearchEngine>, EngineError> {
    Ok(Box::new(YandexSearchEngine::new(credentials, headers, count)?))
}

#[cfg(not(feature = "yandex"))]
fn yandex_engine(
    _credentials: &BTreeMap<String, String>,
    _headers: &[(String, String)],
    _count: usize,
) -> Result<Box<dyn SearchEngine>, EngineError> {
    Err(EngineError::Unsupported {
        engine: "Yandex",
        reason: "built without the `yandex` feature",
    })
}

/// Shared HTTP plumbing for the engine adapters.
struct SearchClient {
    engine: &'static str,
    client: Client,
    headers: Vec<(String, String)>,
}

impl SearchClient {
    fn new(engine: &'static str, headers: &[(String, String)]) -> Result<Self, EngineError> {
        let client = Client::builder()
            .gzip(true)
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|error| EngineError::Client {
                engine,
                reason: error.to_string(),
            })?;
        Ok(Self {
            engine,
            client,
            headers: headers.to_vec(),
        })
    }

    fn open(&self, mut builder: RequestBuilder) -> Result<Vec<u8>, SearchQueryError> {
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().map_err(|error| SearchQueryError::Transport {
            engine: self.engine,
            reason: error.to_string(),
        })?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(SearchQueryError::Status {
                engine: self.engine,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().map_err(|error| SearchQueryError::Transport {
            engine: self.engine,
            reason: error.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

fn credential(
    credentials: &BTreeMap<String, String>,
    engine: &'static str,
    key: &'static str,
) -> Result<String, EngineError> {
    credentials
        .get(key)
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .ok_or(EngineError::MissingCredential { engine, key })
}

/// Strip quotes and wrap the query as a single phrase.
fn quote_query(query: &str) -> String {
    format!("\"{}\"", query.replace('"', ""))
}

fn decode_json(engine: &'static str, body: &[u8]) -> Result<Value, SearchQueryError> {
    serde_json::from_slice(body).map_err(|_| SearchQueryError::Malformed {
        engine,
        reason: "JSON could not be decoded".to_string(),
    })
}

pub struct BingSearchEngine {
    http: SearchClient,
    key: String,
    service: &'static str,
    count: usize,
}

impl BingSearchEngine {
    pub fn new(
        credentials: &BTreeMap<String, String>,
        headers: &[(String, String)],
        count: usize,
    ) -> Result<Self, EngineError> {
        let key = credential(credentials, "Bing", "key")?;
        let service = match credentials.get("type").map(String::as_str) {
            Some("searchweb") => "SearchWeb",
            _ => "Search",
        };
        Ok(Self {
            http: SearchClient::new("Bing", headers)?,
            key,
            service,
            count,
        })
    }
}

impl SearchEngine for BingSearchEngine {
    fn name(&self) -> &'static str {
        "Bing"
    }

    fn search(&self, query: &str) -> Result<Vec<String>, SearchQueryError> {
        let url = format!("https://api.datamarket.azure.com/Bing/{}/Web", self.service);
        let params = [
            ("$format", "json".to_string()),
            ("$top", self.count.to_string()),
            ("Query", format!("'{}'", quote_query(query))),
            ("Market", "'en-US'".to_string()),
            ("Adult", "'Off'".to_string()),
            ("Options", "'DisableLocationDetection'".to_string()),
            (
                "WebSearchOptions",
                "'DisableHostCollapsing+DisableQueryAlterations'".to_string(),
            ),
        ];
        debug!(engine = "Bing", query, "search");
        let builder = self
            .http
            .client
            .get(url)
            .basic_auth(&self.key, Some(&self.key))
            .query(&params);
        parse_bing_response(&self.http.open(builder)?)
    }
}

pub fn parse_bing_response(body: &[u8]) -> Result<Vec<String>, SearchQueryError> {
    let payload = decode_json("Bing", body)?;
    let Some(results) = payload
        .get("d")
        .and_then(|data| data.get("results"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };
    Ok(results
        .iter()
        .filter_map(|result| result.get("Url").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

pub struct GoogleSearchEngine {
    http: SearchClient,
    cx: String,
    key: String,
    domain: String,
    count: usize,
}

impl GoogleSearchEngine {
    pub fn new(
        credentials: &BTreeMap<String, String>,
        headers: &[(String, String)],
        count: usize,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            cx: credential(credentials, "Google", "id")?,
            key: credential(credentials, "Google", "key")?,
            domain: credentials
                .get("proxy")
                .cloned()
                .unwrap_or_else(|| "www.googleapis.com".to_string()),
            http: SearchClient::new("Google", headers)?,
            count,
        })
    }
}

impl SearchEngine for GoogleSearchEngine {
    fn name(&self) -> &'static str {
        "Google"
    }

    fn search(&self, query: &str) -> Result<Vec<String>, SearchQueryError> {
        let url = format!("https://{}/customsearch/v1", self.domain);
        let params = [
            ("cx", self.cx.clone()),
            ("key", self.key.clone()),
            ("q", quote_query(query)),
            ("alt", "json".to_string()),
            ("num", self.count.to_string()),
            ("safe", "off".to_string()),
            ("fields", "items(link)".to_string()),
        ];
        debug!(engine = "Google", query, "search");
        let builder = self.http.client.get(url).query(&params);
        parse_google_response(&self.http.open(builder)?)
    }
}

pub fn parse_google_response(body: &[u8]) -> Result<Vec<String>, SearchQueryError> {
    let payload = decode_json("Google", body)?;
    let Some(items) = payload.get("items").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(|item| item.get("link").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(feature = "yandex")]
pub struct YandexSearchEngine {
    http: SearchClient,
    user: String,
    key: String,
    domain: String,
    count: usize,
}

#[cfg(feature = "yandex")]
impl YandexSearchEngine {
    pub fn new(
        credentials: &BTreeMap<String, String>,
        headers: &[(String, String)],
        count: usize,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            user: credential(credentials, "Yandex", "user")?,
            key: credential(credentials, "Yandex", "key")?,
            domain: credentials
                .get("proxy")
                .cloned()
                .unwrap_or_else(|| "yandex.com".to_string()),
            http: SearchClient::new("Yandex", headers)?,
            count,
        })
    }
}

#[cfg(feature = "yandex")]
impl SearchEngine for YandexSearchEngine {
    fn name(&self) -> &'static str {
        "Yandex"
    }

    fn search(&self, query: &str) -> Result<Vec<String>, SearchQueryError> {
        let url = format!("https://{}/search/xml", self.domain);
        // The XML API rejects most punctuation in phrase queries.
        let cleaned = query
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == ' ')
            .collect::<String>();
        let params = [
            ("user", self.user.clone()),
            ("key", self.key.clone()),
            ("query", quote_query(&cleaned)),
            ("l10n", "en".to_string()),
            ("filter", "none".to_string()),
            ("maxpassages", "1".to_string()),
            (
                "groupby",
                format!("mode=flat.groups-on-page={}", self.count),
            ),
        ];
        debug!(engine = "Yandex", query, "search");
        let builder = self.http.client.get(url).query(&params);
        parse_yandex_response(&self.http.open(builder)?)
    }
}

#[cfg(feature = "yandex")]
pub fn parse_yandex_response(body: &[u8]) -> Result<Vec<String>, SearchQueryError> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let text = String::from_utf8_lossy(body);
    let mut reader = Reader::from_str(&text);
    let mut buf = Vec::new();
    let mut in_url = false;
    let mut urls = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => in_url = element.name().as_ref() == b"url",
            Ok(Event::End(_)) => in_url = false,
            Ok(Event::Text(element)) if in_url => {
                let value = element.unescape().map_err(|error| SearchQueryError::Malformed {
                    engine: "Yandex",
                    reason: format!("XML parse error: {error}"),
                })?;
                let value = value.trim();
                if !value.is_empty() {
                    urls.push(value.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(error) => {
                return Err(SearchQueryError::Malformed {
                    engine: "Yandex",
                    reason: format!("XML parse error: {error}"),
                });
            }
        }
        buf.clear();
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;

    fn config_with(engine: &str, credentials: &[(&str, &str)]) -> CopyvioConfig {
        CopyvioConfig {
            search: SearchConfig {
                engine: Some(engine.to_string()),
                credentials: credentials
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                ..SearchConfig::default()
            },
            ..CopyvioConfig::default()
        }
    }

    #[test]
    fn engine_names_are_case_insensitive() {
        let engine = get_search_engine(&config_with("google", &[("id", "cx"), ("key", "k")]), &[])
            .expect("google engine");
        assert_eq!(engine.name(), "Google");
        let engine = get_search_engine(&config_with("BING", &[("key", "k")]), &[]).expect("bing");
        assert_eq!(engine.name(), "Bing");
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let error = get_search_engine(&config_with("AltaVista", &[]), &[])
            .err()
            .expect("must fail");
        assert!(matches!(error, EngineError::Unknown(name) if name == "AltaVista"));
    }

    #[test]
    fn missing_credential_is_reported() {
        let error = get_search_engine(&config_with("Google", &[("key", "k")]), &[])
            .err()
            .expect("must fail");
        assert!(matches!(
            error,
            EngineError::MissingCredential {
                engine: "Google",
                key: "id"
            }
        ));
    }

    #[test]
    fn query_quotes_are_replaced() {
        assert_eq!(quote_query(r#"say "hello" now"#), r#""say hello now""#);
    }

    #[test]
    fn google_response_lists_links() {
        let body = br#"{"items": [{"link": "https://a.example/"}, {"link": "https://b.example/x"}]}"#;
        assert_eq!(
            parse_google_response(body).expect("parse"),
            vec!["https://a.example/", "https://b.example/x"]
        );
        assert!(parse_google_response(b"{}").expect("parse").is_empty());
        assert!(matches!(
            parse_google_response(b"<html>"),
            Err(SearchQueryError::Malformed { .. })
        ));
    }

    #[test]
    fn bing_response_lists_urls() {
        let body = br#"{"d": {"results": [{"Url": "https://a.example/"}]}}"#;
        assert_eq!(parse_bing_response(body).expect("parse"), vec!["https://a.example/"]);
        assert!(parse_bing_response(br#"{"d": {}}"#).expect("parse").is_empty());
    }

    #[cfg(feature = "yandex")]
    #[test]
    fn yandex_response_lists_url_elements() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<yandexsearch><response><results><grouping>
<group><doc><url>https://a.example/page?x=1&amp;y=2</url><title>A</title></doc></group>
<group><doc><url>https://b.example/</url></doc></group>
</grouping></results></response></yandexsearch>"#;
        assert_eq!(
            parse_yandex_response(body).expect("parse"),
            vec!["https://a.example/page?x=1&y=2", "https://b.example/"]
        );
    }

    #[cfg(not(feature = "yandex"))]
    #[test]
    fn yandex_without_feature_is_unsupported() {
        let error = get_search_engine(&config_with("Yandex", &[("user", "u"), ("key", "k")]), &[])
            .err()
            .expect("must fail");
        assert!(matches!(error, EngineError::Unsupported { engine: "Yandex", .. }));
    }
}
