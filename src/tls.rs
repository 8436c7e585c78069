use std::io::{self, ErrorKind::InvalidData};
use std::{fs::File, io::BufReader, path::Path};
use tokio_rustls::rustls::{
  internal::pemfile::{certs, pkcs8_private_keys, rsa_private_keys},
  Certificate, NoClientAuth, PrivateKey, ServerConfig,
};

/// Builds the listener's TLS config from the key/certificate pair named in
/// `protocol_options`.
pub fn server_config<P1, P2>(certificate_path: P1, private_key_path: P2) -> io::Result<ServerConfig>
where
  P1: AsRef<Path>,
  P2: AsRef<Path>,
{
  let certificates = load_certs(certificate_path)?;
  let private_key = load_key(private_key_path)?;

  let mut config = ServerConfig::new(NoClientAuth::new());
  config
    .set_single_cert(certificates, private_key)
    .map_err(|e| io::Error::new(InvalidData, e))?;
  Ok(config)
}

fn load_certs<P>(path: P) -> io::Result<Vec<Certificate>>
where
  P: AsRef<Path>,
{
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);
  certs(&mut reader).map_err(|_| io::Error::new(InvalidData, "invalid cert"))
}

// PKCS#8 first, RSA second.
fn load_key<P>(path: P) -> io::Result<PrivateKey>
where
  P: AsRef<Path>,
{
  let file = File::open(&path)?;
  let mut reader = BufReader::new(file);
  let mut keys = pkcs8_private_keys(&mut reader).map_err(|_| io::Error::new(InvalidData, "invalid key"))?;

  if keys.is_empty() {
    let file = File::open(&path)?;
    let mut reader = BufReader::new(file);
    keys = rsa_private_keys(&mut reader).map_err(|_| io::Error::new(InvalidData, "invalid key"))?;
  }

  keys
    .into_iter()
    .next()
    .ok_or_else(|| io::Error::new(InvalidData, "no private key found"))
}
