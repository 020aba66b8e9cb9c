// SPDX-License-Identifier: MIT

// boringproxy - Certificate manager
// Owns per-domain server certificates behind the two-method interface the
// connection plane needs: manage_sync(domains) and get_certificate(sni).
// Certificates are issued locally with rcgen and cached under cert-dir; a
// different issuance backend can sit behind the same interface without the
// rest of the system noticing.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::debug;

use crate::error::{Error, Result};

/// ALPN protocol id used by TLS-ALPN-01 challenges. Connections that
/// negotiate it are closed right after the handshake.
pub const ALPN_ACME_TLS1: &[u8] = b"acme-tls/1";

/// Issuance settings. Only `dir` changes local behavior; the ACME fields are
/// carried for the operator-facing flag surface and logged at issuance time.
#[derive(Debug, Clone, Default)]
pub struct CertConfig {
    pub dir: Option<PathBuf>,
    pub acme_email: Option<String>,
    pub acme_use_staging: bool,
    pub accept_ca_terms: bool,
    pub ca_url: Option<String>,
}

#[derive(Clone)]
pub struct CertManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CertConfig,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    default_cert: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertManager {
    pub fn new(config: CertConfig) -> Result<Self> {
        if let Some(dir) = &config.dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                certs: RwLock::new(HashMap::new()),
                default_cert: RwLock::new(None),
            }),
        })
    }

    /// Ensure a certificate exists for every domain, issuing any that are
    /// missing. The first managed domain becomes the default certificate
    /// served to clients whose SNI matches nothing.
    pub fn manage_sync(&self, domains: &[String]) -> Result<()> {
        for domain in domains {
            if self.inner.certs.read().unwrap().contains_key(domain) {
                continue;
            }

            let key = self.load_or_issue(domain)?;
            self.inner
                .certs
                .write()
                .unwrap()
                .insert(domain.clone(), key.clone());

            let mut default = self.inner.default_cert.write().unwrap();
            if default.is_none() {
                *default = Some(key);
            }
        }
        Ok(())
    }

    /// Look up the certificate for an SNI name, falling back to the default
    /// certificate when the name is unknown.
    pub fn get_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.inner.certs.read().unwrap().get(server_name) {
            return Some(key.clone());
        }
        self.inner.default_cert.read().unwrap().clone()
    }

    pub fn resolver(&self) -> Arc<SniResolver> {
        Arc::new(SniResolver {
            manager: self.clone(),
        })
    }

    /// rustls server config with SNI resolution through this manager and the
    /// ALPN set the front listener needs (h2, http/1.1, acme-tls/1).
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver());
        config.alpn_protocols = vec![
            b"h2".to_vec(),
            b"http/1.1".to_vec(),
            ALPN_ACME_TLS1.to_vec(),
        ];
        Arc::new(config)
    }

    fn load_or_issue(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(dir) = &self.inner.config.dir {
            let cert_path = dir.join(format!("{domain}.crt"));
            let key_path = dir.join(format!("{domain}.key"));

            if cert_path.exists() && key_path.exists() {
                debug!(domain, "loading certificate from disk");
                let cert_pem = fs::read_to_string(&cert_path)?;
                let key_pem = fs::read_to_string(&key_path)?;
                return certified_key(&cert_pem, &key_pem).map(Arc::new);
            }

            let (cert_pem, key_pem) = self.issue(domain)?;
            fs::write(&cert_path, &cert_pem)?;
            fs::write(&key_path, &key_pem)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
            }
            return certified_key(&cert_pem, &key_pem).map(Arc::new);
        }

        let (cert_pem, key_pem) = self.issue(domain)?;
        certified_key(&cert_pem, &key_pem).map(Arc::new)
    }

    fn issue(&self, domain: &str) -> Result<(String, String)> {
        debug!(
            domain,
            email = ?self.inner.config.acme_email,
            staging = self.inner.config.acme_use_staging,
            "issuing certificate"
        );

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| Error::Certificate(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, domain);

        let key_pair = KeyPair::generate().map_err(|e| Error::Certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(e.to_string()))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

fn certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Certificate("no certificates in PEM".into()));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))?
            .ok_or_else(|| Error::Certificate("no private key in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| Error::Certificate(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI callback bridging rustls to the manager's certificate cache.
pub struct SniResolver {
    manager: CertManager,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.manager.get_certificate(name),
            None => self.manager.get_certificate(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: Option<PathBuf>) -> CertManager {
        CertManager::new(CertConfig {
            dir,
            ..CertConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn issues_and_resolves_certificates() {
        let certs = manager(None);
        certs
            .manage_sync(&["a.example".to_string(), "b.example".to_string()])
            .unwrap();

        assert!(certs.get_certificate("a.example").is_some());
        assert!(certs.get_certificate("b.example").is_some());

        // Unknown SNI falls back to the default (first managed) certificate.
        let default = certs.get_certificate("unknown.example").unwrap();
        let first = certs.get_certificate("a.example").unwrap();
        assert!(Arc::ptr_eq(&default, &first));
    }

    #[test]
    fn no_certificate_before_manage() {
        let certs = manager(None);
        assert!(certs.get_certificate("a.example").is_none());
    }

    #[test]
    fn persists_and_reloads_from_cert_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let certs = manager(Some(path.clone()));
        certs.manage_sync(&["a.example".to_string()]).unwrap();

        let cert_file = path.join("a.example.crt");
        let key_file = path.join("a.example.key");
        assert!(cert_file.exists());
        assert!(key_file.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_file).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        // A second manager over the same directory reuses the stored pair.
        let before = fs::read(&cert_file).unwrap();
        let reloaded = manager(Some(path));
        reloaded.manage_sync(&["a.example".to_string()]).unwrap();
        assert_eq!(fs::read(&cert_file).unwrap(), before);
        assert!(reloaded.get_certificate("a.example").is_some());
    }

    #[test]
    fn server_config_advertises_expected_alpn() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let certs = manager(None);
        certs.manage_sync(&["a.example".to_string()]).unwrap();
        let config = certs.server_config();
        assert_eq!(
            config.alpn_protocols,
            vec![
                b"h2".to_vec(),
                b"http/1.1".to_vec(),
                ALPN_ACME_TLS1.to_vec()
            ]
        );
    }

    #[test]
    fn manage_sync_is_idempotent() {
        let certs = manager(None);
        certs.manage_sync(&["a.example".to_string()]).unwrap();
        let first = certs.get_certificate("a.example").unwrap();
        certs.manage_sync(&["a.example".to_string()]).unwrap();
        let second = certs.get_certificate("a.example").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
