// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::error::Error;
use std::fs::File;
use std::io::Read;

use grpcio::{
    CertificateRequestType, Channel, ChannelBuilder, ChannelCredentialsBuilder, ServerBuilder,
    ServerCredentialsBuilder,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct SecurityConfig {
    pub ca_path: String,
    pub cert_path: String,
    pub key_path: String,
}

/// Checks and opens a key file. Returns `Ok(None)` if the path is empty.
///
/// `tag` is only used in the error message, like "ca key", "cert key",
/// "private key", etc.
fn check_key_file(tag: &str, path: &str) -> Result<Option<File>, Box<dyn Error>> {
    if path.is_empty() {
        return Ok(None);
    }
    match File::open(path) {
        Err(e) => Err(format!("failed to open {} to load {}: {:?}", path, tag, e).into()),
        Ok(f) => Ok(Some(f)),
    }
}

/// Loads the file content. Returns `Ok(vec![])` if the path is empty.
fn load_key(tag: &str, path: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut key = vec![];
    let f = check_key_file(tag, path)?;
    match f {
        None => return Ok(vec![]),
        Some(mut f) => {
            if let Err(e) = f.read_to_end(&mut key) {
                return Err(format!("failed to load {} from path {}: {:?}", tag, path, e).into());
            }
        }
    }
    Ok(key)
}

impl SecurityConfig {
    /// Validates ca, cert and private key: either none or all of them must be
    /// configured.
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        check_key_file("ca key", &self.ca_path)?;
        check_key_file("cert key", &self.cert_path)?;
        check_key_file("private key", &self.key_path)?;
        if (!self.ca_path.is_empty() || !self.cert_path.is_empty() || !self.key_path.is_empty())
            && (self.ca_path.is_empty() || self.cert_path.is_empty() || self.key_path.is_empty())
        {
            return Err("ca, cert and private key should be all configured.".into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct Certs {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

/// Loads TLS material once and hands out secure (or insecure) channels and
/// server bindings. Mutual TLS is enabled whenever a CA is configured.
#[derive(Default)]
pub struct SecurityManager {
    certs: Certs,
}

impl SecurityManager {
    pub fn new(cfg: &SecurityConfig) -> Result<SecurityManager, Box<dyn Error>> {
        cfg.validate()?;
        Ok(SecurityManager {
            certs: Certs {
                ca: load_key("CA", &cfg.ca_path)?,
                cert: load_key("certificate", &cfg.cert_path)?,
                key: load_key("private key", &cfg.key_path)?,
            },
        })
    }

    pub fn connect(&self, cb: ChannelBuilder, addr: &str) -> Channel {
        if self.certs.ca.is_empty() {
            cb.connect(addr)
        } else {
            let cred = ChannelCredentialsBuilder::new()
                .root_cert(self.certs.ca.clone())
                .cert(self.certs.cert.clone(), self.certs.key.clone())
                .build();
            cb.secure_connect(addr, cred)
        }
    }

    pub fn bind(&self, sb: ServerBuilder, addr: &str, port: u16) -> ServerBuilder {
        if self.certs.ca.is_empty() {
            sb.bind(addr, port)
        } else {
            let cred = ServerCredentialsBuilder::new()
                .root_cert(
                    self.certs.ca.clone(),
                    CertificateRequestType::RequestAndRequireClientCertificateAndVerify,
                )
                .add_cert(self.certs.cert.clone(), self.certs.key.clone())
                .build();
            sb.bind_with_cred(addr, port, cred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_config_validate() {
        let mut cfg = SecurityConfig::default();
        cfg.validate().unwrap();

        // Only a subset of the paths is rejected.
        cfg.ca_path = "/tmp/nonexistent-ca".to_owned();
        cfg.validate().unwrap_err();
    }

    #[test]
    fn test_insecure_connect() {
        let mgr = SecurityManager::new(&SecurityConfig::default()).unwrap();
        let env = std::sync::Arc::new(grpcio::EnvBuilder::new().build());
        // Dialing is lazy, so an unreachable address still yields a channel.
        let _ = mgr.connect(grpcio::ChannelBuilder::new(env), "127.0.0.1:1");
    }
}
