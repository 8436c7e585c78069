use crate::{
  balancing::Target,
  error::{BalancerError, ErrorSink},
  server::Scheme,
};
use gethostname::gethostname;
use hyper::{
  client::{conn, HttpConnector},
  header::{HeaderMap, HeaderValue},
  Body, Client, Request, Response, StatusCode, Uri,
};
use log::debug;
use std::{net::SocketAddr, sync::Arc};
use tokio::{io::copy_bidirectional, net::TcpStream};

/// Forwards one ordinary HTTP exchange to the target worker. The body
/// streams through the shared client; nothing is buffered here.
pub async fn proxy_request(
  client: &Client<HttpConnector, Body>,
  request: Request<Body>,
  target: &Target,
  client_address: &SocketAddr,
  scheme: Scheme,
) -> Result<Response<Body>, BalancerError> {
  let backend_request = backend_request(request, target, client_address, scheme)?;
  Ok(client.request(backend_request).await?)
}

fn backend_request(
  request: Request<Body>,
  target: &Target,
  client_address: &SocketAddr,
  scheme: Scheme,
) -> Result<Request<Body>, BalancerError> {
  let (parts, body) = request.into_parts();

  let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  let uri = Uri::builder()
    .scheme("http")
    .authority(target.authority().as_str())
    .path_and_query(path)
    .build()?;

  let forwarded_for = forwarded_for_header(parts.headers.get("x-forwarded-for"), client_address.ip().to_string());

  let mut backend = Request::builder().method(parts.method).uri(uri).body(body)?;
  *backend.headers_mut() = parts.headers;
  append_forwarded_headers(backend.headers_mut(), forwarded_for, client_address, scheme);
  Ok(backend)
}

fn append_forwarded_headers(
  headers: &mut HeaderMap,
  forwarded_for: String,
  client_address: &SocketAddr,
  scheme: Scheme,
) {
  if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
    headers.insert("x-forwarded-for", value);
  }
  if let Ok(value) = HeaderValue::from_str(&client_address.ip().to_string()) {
    headers.insert("x-real-ip", value);
  }
  headers.insert(
    "x-forwarded-port",
    HeaderValue::from_static(match scheme {
      Scheme::Http => "80",
      Scheme::Https => "443",
    }),
  );
  headers.insert(
    "x-forwarded-proto",
    HeaderValue::from_static(match scheme {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }),
  );
  if let Ok(hostname) = gethostname().into_string() {
    if let Ok(value) = HeaderValue::from_str(&hostname) {
      headers.insert("x-forwarded-server", value);
    }
  }
}

// According to https://docs.oracle.com/en-us/iaas/Content/Balance/Reference/httpheaders.htm
fn forwarded_for_header(existing_forwarded_for: Option<&HeaderValue>, client_ip: String) -> String {
  match existing_forwarded_for {
    Some(existing_forwarded_for) => {
      let mut forwarded_for = existing_forwarded_for.to_str().unwrap_or("").to_owned();
      forwarded_for.push_str(&format!(", {}", &client_ip));
      forwarded_for
    }
    None => client_ip,
  }
}

/// Tunnels a WebSocket upgrade. The handshake is replayed against the
/// target worker; on `101 Switching Protocols` both connections are
/// upgraded and bytes are copied in both directions until either side
/// closes, which closes the other. A declined handshake is relayed back
/// unchanged.
pub async fn proxy_upgrade(
  request: Request<Body>,
  target: &Target,
  sink: Arc<ErrorSink>,
) -> Result<Response<Body>, BalancerError> {
  let stream = TcpStream::connect((target.host, target.port)).await?;
  let (mut sender, connection) = conn::handshake(stream).await?;

  {
    let sink = sink.clone();
    tokio::spawn(async move {
      if let Err(error) = connection.await {
        sink.emit(&BalancerError::Hyper(error));
      }
    });
  }

  let backend_response = sender.send_request(handshake_request(&request)?).await?;

  if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
    debug!("backend {} declined upgrade with {}", target, backend_response.status());
    return Ok(backend_response);
  }

  let mut relay = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS).body(Body::empty())?;
  *relay.headers_mut() = backend_response.headers().clone();

  // The client half only becomes available once the 101 head has been
  // written back, so the tunnel runs detached from this handler.
  tokio::spawn(async move {
    let mut backend_io = match hyper::upgrade::on(backend_response).await {
      Ok(upgraded) => upgraded,
      Err(error) => {
        sink.emit(&BalancerError::Hyper(error));
        return;
      }
    };
    let mut client_io = match hyper::upgrade::on(request).await {
      Ok(upgraded) => upgraded,
      Err(error) => {
        sink.emit(&BalancerError::Hyper(error));
        return;
      }
    };
    match copy_bidirectional(&mut client_io, &mut backend_io).await {
      Ok((to_backend, to_client)) => {
        debug!("websocket tunnel closed ({} bytes up, {} bytes down)", to_backend, to_client)
      }
      Err(error) => sink.emit(&BalancerError::Io(error)),
    }
  });

  Ok(relay)
}

// Origin-form URI for the backend connection; the upgrade headers travel
// along with the rest of the handshake unchanged.
fn handshake_request(request: &Request<Body>) -> Result<Request<Body>, BalancerError> {
  let path = request.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  let mut backend = Request::builder().method(request.method().clone()).uri(path).body(Body::empty())?;
  *backend.headers_mut() = request.headers().clone();
  Ok(backend)
}

/// Emitted when the backend fails before any part of the response went out.
pub fn proxy_error_response(error: &BalancerError) -> Response<Body> {
  Response::builder()
    .status(StatusCode::INTERNAL_SERVER_ERROR)
    .header("content-type", "text/html")
    .body(Body::from(format!("Proxy error - {}", error)))
    .unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn forwarded_for_header_without_existing_value() {
    let forwarded_for = forwarded_for_header(None, "127.0.0.1".into());

    assert_eq!(forwarded_for, "127.0.0.1");
  }

  #[test]
  fn forwarded_for_header_appends_to_existing_value() {
    let forwarded_for = forwarded_for_header(Some(&HeaderValue::from_static("127.0.0.2")), "127.0.0.1".into());

    assert_eq!(forwarded_for, "127.0.0.2, 127.0.0.1");
  }

  #[test]
  fn backend_request_targets_the_worker() {
    let request = Request::builder()
      .uri("https://balancer.localhost/app/page?sid=a_8042_b_c")
      .header("host", "balancer.localhost")
      .body(Body::empty())
      .unwrap();
    let client_address: SocketAddr = "203.0.113.7:52810".parse().unwrap();

    let backend = backend_request(request, &Target::loopback(8042), &client_address, Scheme::Https).unwrap();

    assert_eq!(backend.uri().authority().unwrap().as_str(), "127.0.0.1:8042");
    assert_eq!(backend.uri().path(), "/app/page");
    assert_eq!(backend.uri().query(), Some("sid=a_8042_b_c"));
    assert_eq!(backend.headers().get("x-forwarded-for").unwrap(), "203.0.113.7");
    assert_eq!(backend.headers().get("x-real-ip").unwrap(), "203.0.113.7");
    assert_eq!(backend.headers().get("x-forwarded-proto").unwrap(), "https");
    assert_eq!(backend.headers().get("x-forwarded-port").unwrap(), "443");
    // untouched headers pass through
    assert_eq!(backend.headers().get("host").unwrap(), "balancer.localhost");
  }

  #[test]
  fn backend_request_extends_forwarded_chain() {
    let request = Request::builder()
      .uri("http://balancer.localhost/")
      .header("x-forwarded-for", "10.0.0.5")
      .body(Body::empty())
      .unwrap();
    let client_address: SocketAddr = "192.168.1.1:40000".parse().unwrap();

    let backend = backend_request(request, &Target::loopback(8001), &client_address, Scheme::Http).unwrap();

    assert_eq!(backend.headers().get("x-forwarded-for").unwrap(), "10.0.0.5, 192.168.1.1");
  }

  #[test]
  fn handshake_request_uses_origin_form() {
    let request = Request::builder()
      .uri("http://balancer.localhost/socket?sid=a_1_b_c")
      .header("connection", "Upgrade")
      .header("upgrade", "websocket")
      .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
      .body(Body::empty())
      .unwrap();

    let backend = handshake_request(&request).unwrap();

    assert_eq!(backend.uri().to_string(), "/socket?sid=a_1_b_c");
    assert_eq!(backend.headers().get("upgrade").unwrap(), "websocket");
    assert_eq!(
      backend.headers().get("sec-websocket-key").unwrap(),
      "dGhlIHNhbXBsZSBub25jZQ=="
    );
  }

  #[tokio::test]
  async fn proxy_error_response_shape() {
    let error = BalancerError::Middleware("boom".into());

    let response = proxy_error_response(&error);

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"Proxy error - middleware rejected request: boom" as &[u8]);
  }
}
