//! Request and response types shared by the network and cache layers.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted request: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a request from a method name and a URL that may be relative to `origin`.
  pub fn parse(method: &str, url: &str, origin: &Url) -> Result<Self> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method '{}': {}", method, e))?;
    let url = resolve_url(origin, url)?;
    Ok(Self::new(method, url))
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Cache identity of this request. Fragments never reach the server, so they are dropped.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }
}

/// A fully-read HTTP response. Cloning shares the body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Hex SHA-256 of the body.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}

/// Resolve a manifest or command-line URL against the origin.
pub fn resolve_url(origin: &Url, input: &str) -> Result<Url> {
  origin
    .join(input)
    .map_err(|e| eyre!("Invalid URL '{}' (origin {}): {}", input, origin, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("http://localhost:5000/").unwrap()
  }

  #[test]
  fn test_parse_relative_url() {
    let req = Request::parse("get", "/scan", &origin()).unwrap();
    assert!(req.is_get());
    assert_eq!(req.url.as_str(), "http://localhost:5000/scan");
  }

  #[test]
  fn test_parse_absolute_url_keeps_host() {
    let req = Request::parse("POST", "https://example.com/x", &origin()).unwrap();
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.url.host_str(), Some("example.com"));
  }

  #[test]
  fn test_cache_key_drops_fragment() {
    let req = Request::parse("GET", "/index#top", &origin()).unwrap();
    assert_eq!(req.cache_key(), "http://localhost:5000/index");
  }

  #[test]
  fn test_response_ok_and_header_lookup() {
    let resp = Response {
      url: "http://localhost:5000/".to_string(),
      status: 204,
      headers: vec![("Content-Type".to_string(), "text/html".to_string())],
      body: Bytes::new(),
    };
    assert!(resp.is_ok());
    assert_eq!(resp.header("content-type"), Some("text/html"));

    let not_found = Response {
      status: 404,
      ..resp
    };
    assert!(!not_found.is_ok());
  }
}
