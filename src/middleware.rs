use crate::error::BalancerError;
use async_trait::async_trait;
use hyper::{Body, Request};
use std::{
  fmt,
  net::SocketAddr,
  sync::{Arc, RwLock},
};

/// Which chain a handler belongs to: ordinary HTTP exchanges or WebSocket
/// upgrade handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
  Request,
  Upgrade,
}

pub struct MiddlewareContext {
  pub phase: Phase,
  pub client_address: SocketAddr,
}

/// A gate in front of dispatch. Handlers run strictly in insertion order;
/// each may rewrite the request (headers, extensions) before passing it
/// on, or reject it with an error, which stops the chain and leaves the
/// request unproxied. Handlers must not consume the body.
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
  async fn process(
    &self,
    request: Request<Body>,
    context: &MiddlewareContext,
  ) -> Result<Request<Body>, BalancerError>;
}

#[derive(Debug, Default)]
pub struct MiddlewareChain {
  handlers: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
  pub fn new() -> MiddlewareChain {
    MiddlewareChain::default()
  }

  pub fn append(&self, handler: Arc<dyn Middleware>) {
    self.handlers.write().unwrap().push(handler);
  }

  pub async fn run(
    &self,
    mut request: Request<Body>,
    context: &MiddlewareContext,
  ) -> Result<Request<Body>, BalancerError> {
    let handlers: Vec<Arc<dyn Middleware>> = self.handlers.read().unwrap().clone();
    for handler in handlers {
      request = handler.process(request, context).await?;
    }
    Ok(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use hyper::header::HeaderValue;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug)]
  struct Tag(&'static str);

  #[async_trait]
  impl Middleware for Tag {
    async fn process(
      &self,
      mut request: Request<Body>,
      _context: &MiddlewareContext,
    ) -> Result<Request<Body>, BalancerError> {
      let trail = match request.headers().get("x-trail") {
        Some(existing) => format!("{},{}", existing.to_str().unwrap(), self.0),
        None => self.0.to_string(),
      };
      request
        .headers_mut()
        .insert("x-trail", HeaderValue::from_str(&trail).unwrap());
      Ok(request)
    }
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
      Err(BalancerError::Middleware("nope".into()))
    }
  }

  #[derive(Debug)]
  struct Count(Arc<AtomicUsize>);

  #[async_trait]
  impl Middleware for Count {
    async fn process(
      &self,
      request: Request<Body>,
      _context: &MiddlewareContext,
    ) -> Result<Request<Body>, BalancerError> {
      self.0.fetch_add(1, Ordering::SeqCst);
      Ok(request)
    }
  }

  fn context() -> MiddlewareContext {
    MiddlewareContext {
      phase: Phase::Request,
      client_address: "127.0.0.1:3000".parse().unwrap(),
    }
  }

  #[tokio::test]
  async fn handlers_run_in_insertion_order() {
    let chain = MiddlewareChain::new();
    chain.append(Arc::new(Tag("first")));
    chain.append(Arc::new(Tag("second")));
    chain.append(Arc::new(Tag("third")));

    let request = Request::builder().body(Body::empty()).unwrap();
    let request = chain.run(request, &context()).await.unwrap();

    assert_eq!(request.headers().get("x-trail").unwrap(), "first,second,third");
  }

  #[tokio::test]
  async fn failure_halts_the_chain() {
    let ran = Arc::new(AtomicUsize::new(0));

    let chain = MiddlewareChain::new();
    chain.append(Arc::new(Count(ran.clone())));
    chain.append(Arc::new(Reject));
    chain.append(Arc::new(Count(ran.clone())));

    let request = Request::builder().body(Body::empty()).unwrap();
    let result = chain.run(request, &context()).await;

    assert_eq!(result.is_err(), true);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn empty_chain_passes_requests_through() {
    let chain = MiddlewareChain::new();

    let request = Request::builder().uri("http://lb/app").body(Body::empty()).unwrap();
    let request = chain.run(request, &context()).await.unwrap();

    assert_eq!(request.uri().path(), "/app");
  }
}
