use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// Build the TLS acceptor from the configured PEM files, or `None` when TLS is off.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both RENTD_TLS_CERT and RENTD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(open_pem(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {cert_path}"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open_pem(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open_pem(path: &str) -> io::Result<File> {
    File::open(path).map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_paths() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_rejected() {
        let err = load_tls_acceptor(Some("cert.pem"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(load_tls_acceptor(None, Some("key.pem")).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let path = std::env::temp_dir().join("rentd_test_tls_missing.pem");
        let _ = std::fs::remove_file(&path);
        let path = path.to_string_lossy().to_string();
        let err = load_tls_acceptor(Some(&path), Some(&path)).err().unwrap();
        assert!(err.to_string().contains(&path));
    }

    #[test]
    fn empty_cert_file_rejected() {
        let path = std::env::temp_dir().join("rentd_test_tls_empty.pem");
        std::fs::write(&path, b"").unwrap();
        let path = path.to_string_lossy().to_string();
        let err = load_tls_acceptor(Some(&path), Some(&path)).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }
}
