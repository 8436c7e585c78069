use crate::{
  balancing::{self, quota::QuotaSelector},
  error::{BalancerError, ErrorSink},
  listeners::RemoteAddress,
  middleware::{MiddlewareChain, MiddlewareContext, Phase},
  proxy,
  workers::WorkerRegistry,
};
use arc_swap::ArcSwap;
use futures::{Future, TryFutureExt};
use hyper::{
  client::HttpConnector,
  header::{CONNECTION, UPGRADE},
  server::accept::Accept,
  service::{make_service_fn, Service},
  Body, Client, Request, Response, Server,
};
use log::debug;
use std::{
  fmt, io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
  Http,
  Https,
}

impl fmt::Display for Scheme {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Scheme::Http => write!(f, "http"),
      Scheme::Https => write!(f, "https"),
    }
  }
}

/// Everything a connection's dispatcher needs, shared across connections.
pub struct DispatchShared {
  pub registry: Arc<ArcSwap<WorkerRegistry>>,
  pub selector: Arc<QuotaSelector>,
  pub request_chain: Arc<MiddlewareChain>,
  pub upgrade_chain: Arc<MiddlewareChain>,
  pub sink: Arc<ErrorSink>,
  pub client: Client<HttpConnector, Body>,
  pub use_smart_balancing: bool,
}

pub async fn serve<I, IE, IO>(acceptor: I, shared: Arc<DispatchShared>, scheme: Scheme) -> Result<(), io::Error>
where
  I: Accept<Conn = IO, Error = IE>,
  IE: Into<Box<dyn std::error::Error + Send + Sync>>,
  IO: AsyncRead + AsyncWrite + Unpin + Send + RemoteAddress + 'static,
{
  let service = make_service_fn(move |stream: &IO| {
    let shared = shared.clone();
    let client_address = stream.remote_addr();

    async move {
      Ok::<_, io::Error>(DispatchService {
        client_address: client_address?,
        shared,
        scheme,
      })
    }
  });

  Server::builder(acceptor)
    .serve(service)
    .map_err(|e| {
      let msg = format!("Failed to listen: {}", e);
      io::Error::new(io::ErrorKind::Other, msg)
    })
    .await
}

pub struct DispatchService {
  scheme: Scheme,
  client_address: SocketAddr,
  shared: Arc<DispatchShared>,
}

impl Service<Request<Body>> for DispatchService {
  type Response = Response<Body>;
  type Error = BalancerError;

  // let's allow this complex type. A refactor would make it more complicated due to the used trait types
  #[allow(clippy::type_complexity)]
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, request: Request<Body>) -> Self::Future {
    Box::pin(dispatch(self.shared.clone(), self.scheme, self.client_address, request))
  }
}

pub fn is_upgrade_request(request: &Request<Body>) -> bool {
  let connection_has_upgrade = request
    .headers()
    .get(CONNECTION)
    .and_then(|value| value.to_str().ok())
    .map_or(false, |value| {
      value.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
  connection_has_upgrade && request.headers().contains_key(UPGRADE)
}

async fn dispatch(
  shared: Arc<DispatchShared>,
  scheme: Scheme,
  client_address: SocketAddr,
  request: Request<Body>,
) -> Result<Response<Body>, BalancerError> {
  debug!(
    "{:?} {} {}",
    request.version(),
    request.method(),
    request.uri()
  );

  let phase = if is_upgrade_request(&request) {
    Phase::Upgrade
  } else {
    Phase::Request
  };
  let context = MiddlewareContext { phase, client_address };
  let chain = match phase {
    Phase::Request => &shared.request_chain,
    Phase::Upgrade => &shared.upgrade_chain,
  };

  // Returning Err here closes the connection without writing a response.
  let request = match chain.run(request, &context).await {
    Ok(request) => request,
    Err(error) => {
      shared.sink.emit(&error);
      return Err(error);
    }
  };

  let registry = shared.registry.load_full();
  let target = match balancing::resolve_target(
    &request,
    &client_address,
    &registry,
    &shared.selector,
    shared.use_smart_balancing,
    phase,
  ) {
    Some(target) => target,
    None => {
      let error = BalancerError::NoWorkers;
      shared.sink.emit(&error);
      return Err(error);
    }
  };
  debug!("dispatching to {}", target);

  let result = match phase {
    Phase::Request => proxy::proxy_request(&shared.client, request, &target, &client_address, scheme).await,
    Phase::Upgrade => proxy::proxy_upgrade(request, &target, shared.sink.clone()).await,
  };

  match result {
    Ok(response) => Ok(response),
    Err(error) => {
      shared.sink.emit(&error);
      Ok(proxy::proxy_error_response(&error))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{middleware::Middleware, workers::Worker};
  use async_trait::async_trait;
  use hyper::StatusCode;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn shared(ports: &[u16], use_smart_balancing: bool) -> Arc<DispatchShared> {
    let workers = ports.iter().map(|port| Worker { port: *port }).collect();
    Arc::new(DispatchShared {
      registry: Arc::new(ArcSwap::from_pointee(WorkerRegistry::new(workers))),
      selector: Arc::new(QuotaSelector::new()),
      request_chain: Arc::new(MiddlewareChain::new()),
      upgrade_chain: Arc::new(MiddlewareChain::new()),
      sink: Arc::new(ErrorSink::new()),
      client: Client::new(),
      use_smart_balancing,
    })
  }

  fn client_address() -> SocketAddr {
    "203.0.113.7:52810".parse().unwrap()
  }

  #[test]
  fn upgrade_requests_are_detected() {
    let upgrade = Request::builder()
      .header(CONNECTION, "keep-alive, Upgrade")
      .header(UPGRADE, "websocket")
      .body(Body::empty())
      .unwrap();
    let plain = Request::builder().body(Body::empty()).unwrap();
    let upgrade_header_only = Request::builder().header(UPGRADE, "websocket").body(Body::empty()).unwrap();

    assert_eq!(is_upgrade_request(&upgrade), true);
    assert_eq!(is_upgrade_request(&plain), false);
    assert_eq!(is_upgrade_request(&upgrade_header_only), false);
  }

  #[derive(Debug)]
  struct Reject;

  #[async_trait]
  impl Middleware for Reject {
    async fn process(
      &self,
      _request: Request<Body>,
      _context: &MiddlewareContext,
    ) -> Result<Request<Body>, BalancerError> {
      Err(BalancerError::Middleware("rejected".into()))
    }
  }

  #[tokio::test]
  async fn middleware_failure_abandons_the_request() {
    let shared = shared(&[8001], false);
    shared.request_chain.append(Arc::new(Reject));

    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = emitted.clone();
    shared.sink.subscribe(Box::new(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    }));

    let request = Request::builder().uri("http://lb/app").body(Body::empty()).unwrap();
    let result = dispatch(shared.clone(), Scheme::Http, client_address(), request).await;

    assert_eq!(result.is_err(), true);
    assert_eq!(emitted.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn empty_registry_aborts_without_proxying() {
    let shared = shared(&[], false);

    let request = Request::builder().uri("http://lb/app").body(Body::empty()).unwrap();
    let result = dispatch(shared, Scheme::Http, client_address(), request).await;

    assert_eq!(result.is_err(), true);
  }

  #[tokio::test]
  async fn unreachable_worker_yields_proxy_error_page() {
    // port 1 is essentially never listening, so the connect fails fast
    let shared = shared(&[1], false);

    let request = Request::builder().uri("http://lb/app").body(Body::empty()).unwrap();
    let response = dispatch(shared, Scheme::Http, client_address(), request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body.starts_with(b"Proxy error - "), true);
  }
}
