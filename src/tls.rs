//! TLS transport wrapping.
//!
//! The verification policy follows the derived `connect_tls_verify`
//! setting: `system` trusts the platform store, `cert` trusts exactly one
//! CA file, `hash` skips chain validation and instead pins the SHA-256 of
//! the server's DER certificate, and `none` trusts everything.

use std::net::TcpStream;

use native_tls::{Certificate, Identity, Protocol, TlsConnector};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::settings::{Parm, Settings, TlsVerify};
use crate::stream::Stream;

fn tls_error(stage: &'static str, err: impl std::fmt::Display) -> Error {
    Error::Connect {
        stage,
        message: format!("TLS error: {err}"),
    }
}

/// Perform the TLS handshake over a connected socket and verify the
/// server according to the settings' policy.
pub fn wrap_tls(settings: &Settings, sock: TcpStream) -> Result<Stream> {
    let host = settings.connect_tcp().to_string();
    let verify = settings.connect_tls_verify();

    let mut builder = TlsConnector::builder();
    builder.min_protocol_version(Some(Protocol::Tlsv12));

    match verify {
        TlsVerify::None | TlsVerify::Hash => {
            // hash verification happens below, after the handshake
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        TlsVerify::Cert => {
            let path = settings.get_str(Parm::Cert);
            let pem = std::fs::read(path).map_err(|e| Error::connect("read CA file", e))?;
            let cert =
                Certificate::from_pem(&pem).map_err(|e| tls_error("parse CA file", e))?;
            builder.disable_built_in_roots(true);
            builder.add_root_certificate(cert);
        }
        TlsVerify::System => {
            // the platform trust store is the default
        }
    }

    let clientkey = settings.connect_clientkey();
    if !clientkey.is_empty() {
        let key = std::fs::read(clientkey).map_err(|e| Error::connect("read client key", e))?;
        let cert = std::fs::read(settings.connect_clientcert())
            .map_err(|e| Error::connect("read client certificate", e))?;
        let identity = Identity::from_pkcs8(&cert, &key)
            .map_err(|e| tls_error("load client identity", e))?;
        builder.identity(identity);
    }

    let connector = builder
        .build()
        .map_err(|e| tls_error("create TLS context", e))?;
    let tls = connector
        .connect(&host, sock)
        .map_err(|e| tls_error("TLS handshake", e))?;

    if verify == TlsVerify::Hash {
        let required = settings.connect_certhash_digits();
        debug!(target: "mapi::conn", "verifying certificate hash against prefix '{required}'");
        let cert = tls
            .peer_certificate()
            .map_err(|e| tls_error("certificate hash check", e))?
            .ok_or_else(|| tls_error("certificate hash check", "server did not send a certificate"))?;
        let der = cert
            .to_der()
            .map_err(|e| tls_error("certificate hash check", e))?;
        verify_certhash(&der, required)?;
    }

    debug!(target: "mapi::conn", "TLS handshake succeeded");
    Ok(Stream::Tls(Box::new(tls)))
}

/// Check that the SHA-256 of the DER certificate starts with the digits
/// from `certhash`.
fn verify_certhash(der: &[u8], required_prefix: &str) -> Result<()> {
    if required_prefix.len() > 2 * Sha256::output_size() {
        return Err(Error::Connect {
            stage: "certificate hash check",
            message: "value of certhash= is longer than a sha256 digest".into(),
        });
    }
    let digest = hex::encode(Sha256::digest(der));
    if !digest.starts_with(required_prefix) {
        return Err(Error::Connect {
            stage: "certificate hash check",
            message: "server certificate does not match certhash= prefix".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certhash_prefix_matching() {
        let der = b"not really DER but good enough";
        let digest = hex::encode(Sha256::digest(der));

        verify_certhash(der, &digest).unwrap();
        verify_certhash(der, &digest[..10]).unwrap();
        verify_certhash(der, &digest[..1]).unwrap();
        assert!(verify_certhash(der, "0000000000").is_err() || digest.starts_with("0000000000"));

        // longer than a sha256 digest
        let too_long = "a".repeat(65);
        assert!(verify_certhash(der, &too_long).is_err());
    }
}
