use std::{
    collections::HashMap,
    fs::{self, DirBuilder, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context as _, bail};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;
use x509_parser::{parse_x509_certificate, pem::parse_x509_pem};

pub const CA_CERT_FILE_NAME: &str = "cert.pem";
pub const CA_KEY_FILE_NAME: &str = "key.pem";

const ROOT_CA_COMMON_NAME: &str = "mitmcache Local Root CA";

/// Root CA kept under `output/ca/`, issuing one leaf certificate per intercepted host.
#[derive(Debug)]
pub struct LocalCa {
    cert_path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    server_configs: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

/// A leaf certificate with its PKCS#8 key.
#[derive(Debug)]
pub struct LeafCert {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
}

impl Clone for LeafCert {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            cert_der: self.cert_der.clone(),
            key_der: self.key_der.clone_key(),
        }
    }
}

impl LocalCa {
    /// Loads the CA pair from `dir`, creating it when neither file exists yet.
    ///
    /// A directory holding only one of the two files is refused.
    pub fn load_or_create(dir: &Path) -> anyhow::Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE_NAME);
        let key_path = dir.join(CA_KEY_FILE_NAME);

        let (cert_pem, key_pem) = match (cert_path.exists(), key_path.exists()) {
            (true, true) => (
                fs::read_to_string(&cert_path)
                    .with_context(|| format!("read CA certificate {}", cert_path.display()))?,
                fs::read_to_string(&key_path)
                    .with_context(|| format!("read CA private key {}", key_path.display()))?,
            ),
            (false, false) => {
                let created = create_root(dir)?;
                tracing::info!(cert = %cert_path.display(), "generated local root CA");
                created
            }
            _ => bail!(
                "incomplete CA material in {}: both {CA_CERT_FILE_NAME} and {CA_KEY_FILE_NAME} are required",
                dir.display()
            ),
        };

        let key_pair = matching_key_pair(&cert_pem, &key_pem)
            .with_context(|| format!("CA material in {}", dir.display()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .context("load CA certificate as issuer")?;

        Ok(Self {
            cert_path,
            issuer,
            server_configs: Mutex::new(HashMap::new()),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// TLS acceptor presenting a leaf for `host`, built once per host.
    pub fn acceptor_for(&self, host: &str) -> anyhow::Result<TlsAcceptor> {
        let name = leaf_name(host)
            .with_context(|| format!("no certificate name for CONNECT host `{host}`"))?;

        let mut configs = self
            .server_configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(config) = configs.get(&name) {
            return Ok(TlsAcceptor::from(Arc::clone(config)));
        }

        let leaf = self.issue_leaf(&name)?;
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert_der], PrivateKeyDer::Pkcs8(leaf.key_der))
            .with_context(|| format!("TLS server config for `{name}`"))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let config = Arc::new(config);
        configs.insert(name, Arc::clone(&config));
        Ok(TlsAcceptor::from(config))
    }

    /// Signs a fresh server certificate whose CN and only SAN are `host`.
    pub fn issue_leaf(&self, host: &str) -> anyhow::Result<LeafCert> {
        let mut params = CertificateParams::new(vec![host.to_owned()])
            .with_context(|| format!("leaf certificate parameters for `{host}`"))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let key = KeyPair::generate().context("generate leaf key")?;
        let cert = params
            .signed_by(&key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for `{host}`"))?;

        Ok(LeafCert {
            host: host.to_owned(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
        })
    }
}

/// Lowercased DNS name or IP literal for a CONNECT host, brackets and trailing dot removed.
fn leaf_name(host: &str) -> Option<String> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    let host = match host.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => host,
    };
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

fn create_root(dir: &Path) -> anyhow::Result<(String, String)> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .with_context(|| format!("create CA directory {}", dir.display()))?;

    let mut params = CertificateParams::new(Vec::new()).context("root CA parameters")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, ROOT_CA_COMMON_NAME);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let key = KeyPair::generate().context("generate root CA key")?;
    let cert = params.self_signed(&key).context("self-sign root CA")?;

    let cert_pem = cert.pem();
    let key_pem = key.serialize_pem();
    write_private(&dir.join(CA_CERT_FILE_NAME), &cert_pem)?;
    write_private(&dir.join(CA_KEY_FILE_NAME), &key_pem)?;
    Ok((cert_pem, key_pem))
}

/// Parses the key and checks it belongs to the certificate.
fn matching_key_pair(cert_pem: &str, key_pem: &str) -> anyhow::Result<KeyPair> {
    let key = KeyPair::from_pem(key_pem).context("parse CA private key")?;
    let cert_der = certificate_der_from_pem(cert_pem.as_bytes()).context("parse CA certificate")?;
    let (_, cert) = parse_x509_certificate(&cert_der)
        .map_err(|err| anyhow::anyhow!("decode CA certificate: {err}"))?;

    if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
        bail!("CA certificate and private key do not match");
    }
    Ok(key)
}

/// Decodes the first `CERTIFICATE` block of a PEM document.
pub fn certificate_der_from_pem(pem: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (_, block) = parse_x509_pem(pem).map_err(|err| anyhow::anyhow!("{err}"))?;
    if block.label != "CERTIFICATE" {
        bail!("expected CERTIFICATE block, got {}", block.label);
    }
    Ok(block.contents)
}

/// Creates `path` with mode 0600; never overwrites.
fn write_private(path: &Path, contents: &str) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write {}", path.display()))
}
