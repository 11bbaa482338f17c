//! Plugin handshake and TLS bootstrap.
//!
//! Terraform launches the provider as a child process and reads exactly one
//! line from its stdout:
//!
//! ```text
//! 1|5|tcp|127.0.0.1:PORT|grpc|BASE64_DER_CERT
//! ```
//!
//! That line must be the first thing ever written to stdout. Everything the
//! provider logs goes to stderr. The certificate is a per-process self-signed
//! identity that the server always presents and the line always carries.
//! When Terraform supplies its own certificate, connections must present it.

use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tokio::net::TcpListener;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::error::HandshakeError;
use crate::types::{
    CORE_PROTOCOL_VERSION, HANDSHAKE_PROTOCOL, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, NETWORK_TYPE,
    PROTOCOL_VERSION,
};

/// Environment variable holding Terraform's client certificate (PEM).
pub const CLIENT_CERT_ENV: &str = "PLUGIN_CLIENT_CERT";
/// Environment variable with the lowest port the plugin may listen on.
pub const MIN_PORT_ENV: &str = "PLUGIN_MIN_PORT";
/// Environment variable with the highest port the plugin may listen on.
pub const MAX_PORT_ENV: &str = "PLUGIN_MAX_PORT";
/// Environment variable listing the protocol versions Terraform speaks.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Settings Terraform passes through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Terraform's client certificate; when set, clients must present it.
    pub client_certificate: Option<String>,
    /// Inclusive port range to listen on; any free port when `None`.
    pub port_range: Option<(u16, u16)>,
}

impl HandshakeConfig {
    /// Configuration for running outside Terraform (tests, debugging).
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, HandshakeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through a lookup function.
    ///
    /// Fails unless the magic cookie is present, and when Terraform offers
    /// protocol versions that do not include ours.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HandshakeError> {
        if lookup(MAGIC_COOKIE_KEY).as_deref() != Some(MAGIC_COOKIE_VALUE) {
            return Err(HandshakeError::NotLaunchedByTerraform);
        }

        if let Some(versions) = lookup(PROTOCOL_VERSIONS_ENV) {
            let ours = PROTOCOL_VERSION.to_string();
            if !versions.split(',').any(|v| v.trim() == ours) {
                return Err(HandshakeError::UnsupportedProtocol(versions));
            }
        }

        let port_range = match (lookup(MIN_PORT_ENV), lookup(MAX_PORT_ENV)) {
            (None, None) => None,
            (min, max) => {
                let min = parse_port(min.as_deref(), 0)?;
                let max = parse_port(max.as_deref(), u16::MAX)?;
                if min > max {
                    return Err(HandshakeError::InvalidPortRange(format!("{} > {}", min, max)));
                }
                Some((min, max))
            },
        };

        Ok(Self {
            client_certificate: lookup(CLIENT_CERT_ENV).filter(|pem| !pem.trim().is_empty()),
            port_range,
        })
    }

    /// Set the client certificate.
    pub fn with_client_certificate(mut self, pem: impl Into<String>) -> Self {
        self.client_certificate = Some(pem.into());
        self
    }

    /// Restrict the listen port range.
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = Some((min, max));
        self
    }
}

fn parse_port(value: Option<&str>, default: u16) -> Result<u16, HandshakeError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HandshakeError::InvalidPortRange(format!("invalid port '{}'", raw))),
    }
}

/// Bind the loopback listener, honoring the configured port range.
pub async fn bind_listener(config: &HandshakeConfig) -> Result<TcpListener, HandshakeError> {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Some((min, max)) = config.port_range else {
        return Ok(TcpListener::bind(SocketAddr::new(loopback, 0)).await?);
    };

    for port in min..=max {
        match TcpListener::bind(SocketAddr::new(loopback, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => tracing::trace!(port, error = %err, "Port unavailable"),
        }
    }
    Err(HandshakeError::InvalidPortRange(format!(
        "no free port between {} and {}",
        min, max
    )))
}

/// The per-process identity the plugin presents to Terraform.
///
/// Created once at startup and never persisted.
#[derive(Clone)]
pub struct PluginIdentity {
    /// Protocol version the plugin speaks.
    pub protocol_version: u32,
    /// Address the plugin listens on.
    pub listen_address: SocketAddr,
    certificate_der: Vec<u8>,
    certificate_pem: String,
    private_key_pem: String,
}

impl PluginIdentity {
    /// Generate a fresh self-signed certificate for `listen_address`.
    pub fn generate(listen_address: SocketAddr) -> Result<Self, HandshakeError> {
        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "localhost");
        name.push(DnType::OrganizationName, "Terraform plugin");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let certificate = params.self_signed(&key_pair)?;
        tracing::debug!(address = %listen_address, "Generated plugin certificate");

        Ok(Self {
            protocol_version: PROTOCOL_VERSION,
            listen_address,
            certificate_der: certificate.der().to_vec(),
            certificate_pem: certificate.pem(),
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    /// The certificate as Terraform expects it in the handshake line.
    pub fn certificate_fingerprint(&self) -> String {
        STANDARD_NO_PAD.encode(&self.certificate_der)
    }

    /// The certificate in DER form.
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// The certificate in PEM form.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// The TLS server identity built from this certificate and key.
    pub fn tls_identity(&self) -> Identity {
        Identity::from_pem(&self.certificate_pem, &self.private_key_pem)
    }
}

impl fmt::Debug for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginIdentity")
            .field("protocol_version", &self.protocol_version)
            .field("listen_address", &self.listen_address)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Everything the server needs from the bootstrap phase.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    /// The plugin identity.
    pub identity: PluginIdentity,
    /// Settings from the environment.
    pub config: HandshakeConfig,
}

impl BootstrapContext {
    /// Bundle an identity with its configuration.
    pub fn new(identity: PluginIdentity, config: HandshakeConfig) -> Self {
        Self { identity, config }
    }

    /// Whether clients must present Terraform's certificate.
    pub fn requires_client_certificate(&self) -> bool {
        self.config.client_certificate.is_some()
    }

    /// The handshake line to announce, always carrying the server certificate.
    pub fn handshake(&self) -> Handshake {
        Handshake {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version: self.identity.protocol_version,
            network: NETWORK_TYPE.to_string(),
            address: self.identity.listen_address,
            protocol: HANDSHAKE_PROTOCOL.to_string(),
            certificate: Some(self.identity.certificate_fingerprint()),
        }
    }

    /// Server TLS configuration with the plugin identity.
    ///
    /// Trusts Terraform's certificate as the only client root when one was
    /// supplied.
    pub fn tls_config(&self) -> ServerTlsConfig {
        let tls = ServerTlsConfig::new().identity(self.identity.tls_identity());
        match &self.config.client_certificate {
            Some(client) => tls.client_ca_root(Certificate::from_pem(client)),
            None => tls,
        }
    }
}

/// The parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// go-plugin core protocol version.
    pub core_version: u32,
    /// Application protocol version.
    pub protocol_version: u32,
    /// Network type, always `tcp`.
    pub network: String,
    /// Listen address.
    pub address: SocketAddr,
    /// Wire protocol, always `grpc`.
    pub protocol: String,
    /// Base64 DER server certificate; optional when parsing.
    pub certificate: Option<String>,
}

impl Handshake {
    /// Parse a handshake line.
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('|').collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(HandshakeError::Malformed(format!(
                "expected 5 or 6 fields, found {}",
                fields.len()
            )));
        }

        let number = |index: usize, what: &str| {
            fields[index]
                .parse::<u32>()
                .map_err(|_| HandshakeError::Malformed(format!("invalid {} '{}'", what, fields[index])))
        };

        Ok(Self {
            core_version: number(0, "core version")?,
            protocol_version: number(1, "protocol version")?,
            network: fields[2].to_string(),
            address: fields[3]
                .parse()
                .map_err(|_| HandshakeError::Malformed(format!("invalid address '{}'", fields[3])))?,
            protocol: fields[4].to_string(),
            certificate: fields.get(5).filter(|c| !c.is_empty()).map(|c| c.to_string()),
        })
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.protocol_version, self.network, self.address, self.protocol
        )?;
        if let Some(cert) = &self.certificate {
            write!(f, "|{}", cert)?;
        }
        Ok(())
    }
}

/// The output stream that carries the handshake.
///
/// Counts every byte written through it, so the handshake can refuse to go
/// out once anything else has.
#[derive(Debug)]
pub struct HandshakeChannel<W: Write> {
    inner: W,
    written: u64,
    announced: bool,
}

impl<W: Write> HandshakeChannel<W> {
    /// Wrap an output stream.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            written: 0,
            announced: false,
        }
    }

    /// Write the handshake line and flush.
    ///
    /// Fails if anything was written before, including a previous handshake.
    pub fn announce(&mut self, handshake: &Handshake) -> Result<(), HandshakeError> {
        if self.written > 0 || self.announced {
            return Err(HandshakeError::OutputAlreadyWritten(self.written));
        }
        let line = format!("{}\n", handshake);
        self.inner.write_all(line.as_bytes())?;
        self.inner.flush()?;
        self.written += line.len() as u64;
        self.announced = true;
        tracing::debug!(handshake = %handshake, "Announced handshake");
        Ok(())
    }

    /// Whether the handshake went out.
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    /// Total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Unwrap the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HandshakeChannel<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::BufRead;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn local_addr() -> SocketAddr {
        "127.0.0.1:41234".parse().unwrap()
    }

    #[test]
    fn test_config_requires_magic_cookie() {
        let err = HandshakeConfig::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, HandshakeError::NotLaunchedByTerraform));

        let err = HandshakeConfig::from_lookup(env(&[(MAGIC_COOKIE_KEY, "nope")])).unwrap_err();
        assert!(matches!(err, HandshakeError::NotLaunchedByTerraform));
    }

    #[test]
    fn test_config_from_environment() {
        let config = HandshakeConfig::from_lookup(env(&[
            (MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE),
            (PROTOCOL_VERSIONS_ENV, "4,5"),
            (MIN_PORT_ENV, "10000"),
            (MAX_PORT_ENV, "25000"),
            (CLIENT_CERT_ENV, "-----BEGIN CERTIFICATE-----"),
        ]))
        .unwrap();

        assert_eq!(config.port_range, Some((10000, 25000)));
        assert!(config.client_certificate.is_some());
    }

    #[test]
    fn test_config_rejects_unsupported_protocol() {
        let err = HandshakeConfig::from_lookup(env(&[
            (MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE),
            (PROTOCOL_VERSIONS_ENV, "6"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedProtocol(v) if v == "6"));
    }

    #[test]
    fn test_config_rejects_inverted_port_range() {
        let err = HandshakeConfig::from_lookup(env(&[
            (MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE),
            (MIN_PORT_ENV, "9000"),
            (MAX_PORT_ENV, "8000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidPortRange(_)));
    }

    #[test]
    fn test_identity_generation() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        assert_eq!(identity.protocol_version, 5);
        assert!(identity.certificate_pem().starts_with("-----BEGIN CERTIFICATE-----"));

        let decoded = STANDARD_NO_PAD
            .decode(identity.certificate_fingerprint())
            .unwrap();
        assert_eq!(decoded, identity.certificate_der());
        assert!(!format!("{:?}", identity).contains("PRIVATE KEY"));
    }

    #[test]
    fn test_handshake_line_round_trip() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        let context = BootstrapContext::new(
            identity.clone(),
            HandshakeConfig::new().with_client_certificate("client"),
        );
        let handshake = context.handshake();
        let line = handshake.to_string();

        assert!(line.starts_with("1|5|tcp|127.0.0.1:41234|grpc|"));
        assert!(!line.ends_with('='));
        assert_eq!(Handshake::parse(&line).unwrap(), handshake);
        assert_eq!(handshake.certificate, Some(identity.certificate_fingerprint()));
    }

    #[test]
    fn test_certificate_advertised_without_client_certificate() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        let context = BootstrapContext::new(identity.clone(), HandshakeConfig::new());

        assert!(!context.requires_client_certificate());
        let line = context.handshake().to_string();
        assert_eq!(
            line,
            format!("1|5|tcp|127.0.0.1:41234|grpc|{}", identity.certificate_fingerprint())
        );
        assert_eq!(
            Handshake::parse(&line).unwrap().certificate,
            Some(identity.certificate_fingerprint())
        );

        let with_client = BootstrapContext::new(identity, HandshakeConfig::new().with_client_certificate("client"));
        assert!(with_client.requires_client_certificate());
        assert_eq!(with_client.handshake(), context.handshake());
    }

    #[test]
    fn test_parse_accepts_line_without_certificate() {
        let handshake = Handshake::parse("1|5|tcp|127.0.0.1:1|grpc").unwrap();
        assert_eq!(handshake.certificate, None);
        assert_eq!(handshake.to_string(), "1|5|tcp|127.0.0.1:1|grpc");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Handshake::parse("hello").is_err());
        assert!(Handshake::parse("x|5|tcp|127.0.0.1:1|grpc").is_err());
        assert!(Handshake::parse("1|5|tcp|not-an-address|grpc").is_err());
    }

    #[test]
    fn test_handshake_is_first_line() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        let handshake = BootstrapContext::new(identity, HandshakeConfig::new()).handshake();

        let mut channel = HandshakeChannel::new(Vec::new());
        channel.announce(&handshake).unwrap();
        writeln!(channel, "later output").unwrap();

        let output = channel.into_inner();
        let first = output.as_slice().lines().next().unwrap().unwrap();
        assert_eq!(Handshake::parse(&first).unwrap(), handshake);
    }

    #[test]
    fn test_announce_fails_after_other_output() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        let handshake = BootstrapContext::new(identity, HandshakeConfig::new()).handshake();

        let mut channel = HandshakeChannel::new(Vec::new());
        write!(channel, "starting up").unwrap();
        let err = channel.announce(&handshake).unwrap_err();

        assert!(matches!(err, HandshakeError::OutputAlreadyWritten(11)));
        assert!(!channel.is_announced());
    }

    #[test]
    fn test_announce_only_once() {
        let identity = PluginIdentity::generate(local_addr()).unwrap();
        let handshake = BootstrapContext::new(identity, HandshakeConfig::new()).handshake();

        let mut channel = HandshakeChannel::new(Vec::new());
        channel.announce(&handshake).unwrap();
        assert!(channel.announce(&handshake).is_err());
    }

    #[tokio::test]
    async fn test_bind_listener_on_loopback() {
        let listener = bind_listener(&HandshakeConfig::new()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
