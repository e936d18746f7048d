//! TLS 1.2 Record Layer
//!
//! From-scratch record protection for the fabric's hardened transport:
//!
//! - **Framing**: `[type:1 | version:2 | length:2 BE | payload]`, version
//!   pinned to `{0x03, 0x03}`
//! - **Protection**: AES-128-CBC with a fresh random IV per record, payload
//!   laid out as `[IV:16 | ciphertext]`, plaintext PKCS#7-padded (a full
//!   block of padding when already aligned)
//! - **Key schedule**: P_SHA256 PRF per RFC 5246 §5; 48-byte master secret,
//!   128-byte key block sliced into MAC keys, write keys and IVs
//!
//! Exactly one ciphersuite shape is implemented
//! (`TLS_RSA_WITH_AES_128_CBC_SHA`); there is no negotiation, no session
//! resumption and no extensions. Record confidentiality only: MAC keys are
//! derived and held in the key block, but records carry no MAC and none is
//! verified — a known deviation from RFC 5246 §6.2.3 that the handshake
//! layer documents.
//!
//! The handshake controllers driving this layer live in [`crate::handshake`].

use std::path::Path;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Protocol constants
// ============================================================================

/// Record-layer protocol version, `{major, minor}` = TLS 1.2.
pub const PROTOCOL_VERSION: [u8; 2] = [0x03, 0x03];

/// The single advertised ciphersuite.
pub const TLS_RSA_WITH_AES_128_CBC_SHA: [u8; 2] = [0x00, 0x2F];

/// AES block size; also the record IV length.
pub const BLOCK_SIZE: usize = 16;

/// Record content types per RFC 5246 §6.2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 0x14,
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x14 => Some(ContentType::ChangeCipherSpec),
            0x15 => Some(ContentType::Alert),
            0x16 => Some(ContentType::Handshake),
            0x17 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// Handshake message types per RFC 5246 §7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    ClientHello = 0x01,
    ServerHello = 0x02,
    Certificate = 0x0b,
    CertificateRequest = 0x0d,
    ServerHelloDone = 0x0e,
    CertificateVerify = 0x0f,
    ClientKeyExchange = 0x10,
    Finished = 0x14,
}

/// Which end of the connection this is. Decides the write/read key split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    Client,
    Server,
}

// ============================================================================
// Errors
// ============================================================================

/// Terminal error for the record layer and handshake. Every variant aborts
/// the connection; no alert record is ever transmitted.
#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    /// CSPRNG unavailable.
    Rng,
    Certificate(String),
    PrivateKey(String),
    UnexpectedContentType { expected: ContentType, got: u8 },
    UnexpectedHandshakeType(u8),
    Truncated(&'static str),
    /// A record required protection before the key block was derived.
    KeysNotDerived,
    InvalidPadding,
    KeyExchange(String),
    SignatureVerification,
    InvalidFinished,
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(err) => write!(f, "record I/O failed: {}", err),
            TlsError::Rng => write!(f, "CSPRNG unavailable"),
            TlsError::Certificate(msg) => write!(f, "certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "private key error: {}", msg),
            TlsError::UnexpectedContentType { expected, got } => {
                write!(f, "expected {:?} record, got content type 0x{:02x}", expected, got)
            }
            TlsError::UnexpectedHandshakeType(got) => {
                write!(f, "unexpected handshake message type 0x{:02x}", got)
            }
            TlsError::Truncated(what) => write!(f, "truncated {}", what),
            TlsError::KeysNotDerived => {
                write!(f, "record protection requested before key derivation")
            }
            TlsError::InvalidPadding => write!(f, "invalid record padding"),
            TlsError::KeyExchange(msg) => write!(f, "key exchange failed: {}", msg),
            TlsError::SignatureVerification => write!(f, "certificate verify failed"),
            TlsError::InvalidFinished => write!(f, "invalid Finished message"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        TlsError::Io(err)
    }
}

pub(crate) fn random_bytes(buf: &mut [u8]) -> Result<(), TlsError> {
    getrandom::getrandom(buf).map_err(|_| TlsError::Rng)
}

// ============================================================================
// Certificate material
// ============================================================================

/// A parsed leaf certificate. The raw DER is retained so re-serialization is
/// byte-identical to what was read off the wire or out of the PEM file.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
}

impl LeafCertificate {
    /// Parse a single DER-encoded certificate carrying an RSA public key.
    pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| TlsError::Certificate(format!("DER parse failed: {}", e)))?;

        let spki = cert.public_key();
        let public_key = match spki.parsed() {
            Ok(x509_parser::public_key::PublicKey::RSA(rsa_key)) => RsaPublicKey::new(
                BigUint::from_bytes_be(rsa_key.modulus),
                BigUint::from_bytes_be(rsa_key.exponent),
            )
            .map_err(|e| TlsError::Certificate(format!("bad RSA public key: {}", e)))?,
            Ok(_) => {
                return Err(TlsError::Certificate("certificate key is not RSA".to_string()))
            }
            Err(e) => {
                return Err(TlsError::Certificate(format!("SPKI parse failed: {}", e)))
            }
        };

        Ok(Self { der: der.to_vec(), public_key })
    }

    /// Load the first PEM block of `path` as a leaf certificate.
    pub fn from_pem_file(path: &Path) -> Result<Self, TlsError> {
        let data = std::fs::read(path)
            .map_err(|e| TlsError::Certificate(format!("{}: {}", path.display(), e)))?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
            .map_err(|e| TlsError::Certificate(format!("{}: PEM parse failed: {}", path.display(), e)))?;
        Self::from_der(&pem.contents)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// Load a PKCS#8-wrapped RSA private key from a PEM file.
pub fn read_private_key_from_file(path: &Path) -> Result<RsaPrivateKey, TlsError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| TlsError::PrivateKey(format!("{}: {}", path.display(), e)))?;
    RsaPrivateKey::from_pkcs8_pem(&data)
        .map_err(|e| TlsError::PrivateKey(format!("{}: {}", path.display(), e)))
}

// ============================================================================
// PRF and key schedule
// ============================================================================

/// P_SHA256 per RFC 5246 §5:
///
/// ```text
/// P_hash(secret, seed) = HMAC(secret, A(1) ‖ seed) ‖ HMAC(secret, A(2) ‖ seed) ‖ …
/// A(0) = seed; A(i) = HMAC(secret, A(i-1))
/// ```
///
/// Output is truncated to `output_len` bytes.
pub fn prf(secret: &[u8], seed: &[u8], output_len: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(output_len + 32);
    let mut a = seed.to_vec();

    while output.len() < output_len {
        let mut hmac_a = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        hmac_a.update(&a);
        a = hmac_a.finalize().into_bytes().to_vec();

        let mut hmac_out = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        hmac_out.update(&a);
        hmac_out.update(seed);
        output.extend_from_slice(&hmac_out.finalize().into_bytes());
    }

    output.truncate(output_len);
    output
}

/// `master_secret = PRF(pre_master, "master secret" ‖ clientRandom ‖ serverRandom)[0..48]`.
pub fn derive_master_secret(
    pre_master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> [u8; 48] {
    let mut seed = Vec::with_capacity(13 + 64);
    seed.extend_from_slice(b"master secret");
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);

    let out = prf(pre_master, &seed, 48);
    let mut master = [0u8; 48];
    master.copy_from_slice(&out);
    master
}

/// The six byte-strings sliced out of the 128-byte key-block expansion.
/// MAC keys are derived for completeness but never applied to records.
pub struct KeyMaterial {
    pub client_mac_key: [u8; 20],
    pub server_mac_key: [u8; 20],
    pub client_write_key: [u8; 16],
    pub server_write_key: [u8; 16],
    pub client_iv: [u8; 16],
    pub server_iv: [u8; 16],
    /// Key this end encrypts with (client → clientWrite, server → serverWrite).
    encrypt_key: [u8; 16],
    /// Key this end decrypts with (the peer's write key).
    decrypt_key: [u8; 16],
}

impl KeyMaterial {
    /// `key_block = PRF(master, "key expansion" ‖ serverRandom ‖ clientRandom, 128)`,
    /// sliced at 20/20/16/16/16/16. Must run exactly once per connection,
    /// after both sides have committed to the cipher change and before any
    /// record is encrypted.
    pub fn derive(
        end: ConnectionEnd,
        master_secret: &[u8; 48],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
    ) -> Self {
        let mut seed = Vec::with_capacity(13 + 64);
        seed.extend_from_slice(b"key expansion");
        seed.extend_from_slice(server_random);
        seed.extend_from_slice(client_random);

        let block = prf(master_secret, &seed, 128);

        let mut material = Self {
            client_mac_key: [0; 20],
            server_mac_key: [0; 20],
            client_write_key: [0; 16],
            server_write_key: [0; 16],
            client_iv: [0; 16],
            server_iv: [0; 16],
            encrypt_key: [0; 16],
            decrypt_key: [0; 16],
        };
        material.client_mac_key.copy_from_slice(&block[0..20]);
        material.server_mac_key.copy_from_slice(&block[20..40]);
        material.client_write_key.copy_from_slice(&block[40..56]);
        material.server_write_key.copy_from_slice(&block[56..72]);
        material.client_iv.copy_from_slice(&block[72..88]);
        material.server_iv.copy_from_slice(&block[88..104]);

        match end {
            ConnectionEnd::Client => {
                material.encrypt_key = material.client_write_key;
                material.decrypt_key = material.server_write_key;
            }
            ConnectionEnd::Server => {
                material.encrypt_key = material.server_write_key;
                material.decrypt_key = material.client_write_key;
            }
        }
        material
    }
}

// ============================================================================
// Security parameters
// ============================================================================

/// Per-connection handshake state shared by the record layer and the
/// handshake controllers.
pub struct SecurityParameters {
    pub end: ConnectionEnd,
    pub local_cert: LeafCertificate,
    pub local_key: RsaPrivateKey,
    pub remote_cert: Option<LeafCertificate>,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub master_secret: [u8; 48],
}

impl SecurityParameters {
    pub fn new(end: ConnectionEnd, cert: LeafCertificate, key: RsaPrivateKey) -> Self {
        Self {
            end,
            local_cert: cert,
            local_key: key,
            remote_cert: None,
            client_random: [0; 32],
            server_random: [0; 32],
            master_secret: [0; 48],
        }
    }
}

// ============================================================================
// Record-layer connection
// ============================================================================

/// One record read off the wire, payload still in whatever protection state
/// the peer sent it in.
pub struct TlsRecord {
    pub content_type: ContentType,
    pub payload: Vec<u8>,
}

/// An authenticated, confidential byte-stream wrapper. Construct with
/// [`TlsConnection::client`] or [`TlsConnection::server`], run
/// [`handshake`](TlsConnection::handshake), then exchange application data.
pub struct TlsConnection<S> {
    stream: S,
    pub(crate) params: SecurityParameters,
    pub(crate) keys: Option<KeyMaterial>,
    /// Concatenation of every handshake message exchanged so far, headers
    /// included. Finished messages are never appended.
    pub(crate) transcript: Vec<u8>,
}

impl<S> TlsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Client end over `stream`, loading PEM cert and PKCS#8 key from disk.
    pub fn client(stream: S, cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Self::with_end(stream, ConnectionEnd::Client, cert_path, key_path)
    }

    /// Server end over `stream`, loading PEM cert and PKCS#8 key from disk.
    pub fn server(stream: S, cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Self::with_end(stream, ConnectionEnd::Server, cert_path, key_path)
    }

    fn with_end(
        stream: S,
        end: ConnectionEnd,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, TlsError> {
        let cert = LeafCertificate::from_pem_file(cert_path)?;
        let key = read_private_key_from_file(key_path)?;
        Ok(Self {
            stream,
            params: SecurityParameters::new(end, cert, key),
            keys: None,
            transcript: Vec::new(),
        })
    }

    /// Frame and send one record. The payload goes out as given; callers
    /// encrypt first once the cipher change has happened.
    pub(crate) async fn write_record(
        &mut self,
        content_type: ContentType,
        payload: &[u8],
    ) -> Result<(), TlsError> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(content_type as u8);
        frame.extend_from_slice(&PROTOCOL_VERSION);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Read exactly one record: 5-byte header, then the advertised payload,
    /// drained fully from the underlying reliable stream.
    pub(crate) async fn read_record(&mut self) -> Result<TlsRecord, TlsError> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header).await?;

        let content_type = ContentType::from_u8(header[0]).ok_or(
            TlsError::UnexpectedContentType {
                expected: ContentType::Handshake,
                got: header[0],
            },
        )?;
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;

        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        Ok(TlsRecord { content_type, payload })
    }

    /// PKCS#7-pad, pick a fresh random IV, CBC-encrypt. Output layout is
    /// `[IV:16 | ciphertext]`.
    pub(crate) fn encrypt_payload(&self, plaintext: &[u8]) -> Result<Vec<u8>, TlsError> {
        let keys = self.keys.as_ref().ok_or(TlsError::KeysNotDerived)?;

        let mut iv = [0u8; BLOCK_SIZE];
        random_bytes(&mut iv)?;

        let cipher = Aes128CbcEnc::new_from_slices(&keys.encrypt_key, &iv)
            .expect("AES-128-CBC accepts 16-byte key and IV");
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Split `[IV | ciphertext]`, CBC-decrypt and strip the padding. Every
    /// padding byte is validated.
    pub(crate) fn decrypt_payload(&self, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        let keys = self.keys.as_ref().ok_or(TlsError::KeysNotDerived)?;

        if data.len() < BLOCK_SIZE {
            return Err(TlsError::Truncated("encrypted record"));
        }
        let (iv, ciphertext) = data.split_at(BLOCK_SIZE);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(TlsError::InvalidPadding);
        }

        let cipher = Aes128CbcDec::new_from_slices(&keys.decrypt_key, iv)
            .expect("AES-128-CBC accepts 16-byte key and IV");
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TlsError::InvalidPadding)
    }

    /// Encrypt and send one ApplicationData record.
    pub async fn write_application_data(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let protected = self.encrypt_payload(data)?;
        self.write_record(ContentType::ApplicationData, &protected).await
    }

    /// Read one record and return its decrypted payload.
    pub async fn read_application_data(&mut self) -> Result<Vec<u8>, TlsError> {
        let record = self.read_record().await?;
        match record.content_type {
            ContentType::ApplicationData => self.decrypt_payload(&record.payload),
            other => Err(TlsError::UnexpectedContentType {
                expected: ContentType::ApplicationData,
                got: other as u8,
            }),
        }
    }

    /// The derived key material, once the handshake has completed.
    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref()
    }

    pub fn master_secret(&self) -> &[u8; 48] {
        &self.params.master_secret
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

// ============================================================================
// Tests
// ============================================================================
