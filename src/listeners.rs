use crate::error::{BalancerError, ErrorSink};
use async_stream::stream;
use futures::Stream;
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

/// Stream of accepted connections feeding hyper's server. One acceptor per
/// balancer; plain TCP or TLS depending on the configured protocol.
pub struct Acceptor<T> {
  incoming: Pin<Box<dyn Stream<Item = Result<T, io::Error>> + Send>>,
}

impl hyper::server::accept::Accept for Acceptor<TcpStream> {
  type Conn = TcpStream;
  type Error = io::Error;

  fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    Pin::new(&mut self.incoming).poll_next(cx)
  }
}

impl hyper::server::accept::Accept for Acceptor<TlsStream<TcpStream>> {
  type Conn = TlsStream<TcpStream>;
  type Error = io::Error;

  fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    Pin::new(&mut self.incoming).poll_next(cx)
  }
}

pub async fn bind_http(address: SocketAddr) -> Result<Acceptor<TcpStream>, io::Error> {
  let listener = TcpListener::bind(address).await?;

  let incoming = stream! {
    loop {
      match listener.accept().await {
        Ok((socket, _)) => yield Ok(socket),
        Err(error) => yield Err(error),
      }
    }
  };

  Ok(Acceptor {
    incoming: Box::pin(incoming),
  })
}

/// A failed handshake only skips that connection; the listener stays up.
pub async fn bind_https(
  address: SocketAddr,
  tls_config: ServerConfig,
  sink: Arc<ErrorSink>,
) -> Result<Acceptor<TlsStream<TcpStream>>, io::Error> {
  let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));
  let listener = TcpListener::bind(address).await?;

  let incoming = stream! {
    loop {
      let socket = match listener.accept().await {
        Ok((socket, _)) => socket,
        Err(error) => {
          yield Err(error);
          continue;
        }
      };
      match tls_acceptor.accept(socket).await {
        Ok(tls_stream) => yield Ok(tls_stream),
        Err(error) => sink.emit(&BalancerError::Io(error)),
      }
    }
  };

  Ok(Acceptor {
    incoming: Box::pin(incoming),
  })
}

pub trait RemoteAddress {
  fn remote_addr(&self) -> io::Result<SocketAddr>;
}

impl RemoteAddress for TcpStream {
  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.peer_addr()
  }
}

impl RemoteAddress for TlsStream<TcpStream> {
  fn remote_addr(&self) -> io::Result<SocketAddr> {
    let (stream, _) = self.get_ref();
    stream.peer_addr()
  }
}
