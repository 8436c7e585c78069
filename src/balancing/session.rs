use super::Target;
use hyper::{header::COOKIE, Body, Request};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
  // The session token travels as `sid=` or `ssid=` in either the query
  // string or a cookie. Both are matched with the same pattern, not a
  // strict cookie parser; unusual separators must keep working.
  static ref SESSION_TOKEN: Regex = Regex::new(r"([^A-Za-z0-9]|^)s?sid=([^;]*)").unwrap();
  static ref SESSION_FIELDS: Regex = Regex::new(r"^([^_]*)_([^_]*)_([^_]*)_").unwrap();
}

/// Extracts the worker a session is pinned to. The session value encodes
/// the destination port as its second underscore-separated field, e.g.
/// `node3_8042_f91c_...` routes to port 8042.
pub fn resolve_route(request: &Request<Body>) -> Option<Target> {
  let source = session_source(request)?;
  let value = SESSION_TOKEN.captures(&source)?.get(2)?.as_str();
  let fields = SESSION_FIELDS.captures(value)?;
  let port = fields.get(2)?.as_str().parse::<u16>().ok().filter(|port| *port > 0)?;
  Some(Target::loopback(port))
}

fn session_source(request: &Request<Body>) -> Option<String> {
  if let Some(query) = request.uri().query().filter(|query| !query.is_empty()) {
    return Some(query.to_owned());
  }
  let cookie = request.headers().get(COOKIE)?;
  cookie.to_str().ok().filter(|cookie| !cookie.is_empty()).map(str::to_owned)
}
