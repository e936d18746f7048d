//! TLS 1.2 Handshake Controllers
//!
//! Mutually authenticated RSA-key-exchange handshake over the record layer
//! in [`crate::tls`]:
//!
//! ```text
//! Client                                            Server
//!
//! ClientHello                  -------->
//!                                                   ServerHello
//!                                                   Certificate
//!                                                   CertificateRequest
//!                              <--------        ServerHelloDone
//! Certificate
//! ClientKeyExchange
//! CertificateVerify
//! [ChangeCipherSpec]
//! Finished                     -------->
//!                                              [ChangeCipherSpec]
//!                              <--------             Finished
//! Application Data             <------->     Application Data
//! ```
//!
//! One fixed suite (`TLS_RSA_WITH_AES_128_CBC_SHA` shape), empty session id,
//! null compression, no extensions. Both ends always present a certificate;
//! the client proves possession of its key with CertificateVerify. Any
//! unexpected message, short payload or failed RSA operation is terminal:
//! the error propagates out and the caller drops the stream. No alert is
//! sent and nothing is retried — the handshake is single-shot.

use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::tls::{
    derive_master_secret, random_bytes, ConnectionEnd, ContentType, HandshakeType, KeyMaterial,
    LeafCertificate, TlsConnection, TlsError, PROTOCOL_VERSION, TLS_RSA_WITH_AES_128_CBC_SHA,
};

/// Length of the Finished verify-data.
const VERIFY_DATA_LEN: usize = 12;

// ============================================================================
// Message building
// ============================================================================

/// Frame a handshake body: `[msgType:1 | length:3 BE | body]`.
fn handshake_message(msg_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    debug_assert!(body.len() <= u16::MAX as usize);
    let len = body.len() as u32;
    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(msg_type as u8);
    msg.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    msg.extend_from_slice(body);
    msg
}

/// Hello body shared by both ends: version ‖ random ‖ empty session id ‖
/// the one advertised suite ‖ null compression.
fn hello_body(random: &[u8; 32]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + 32 + 1 + 4 + 2);
    body.extend_from_slice(&PROTOCOL_VERSION);
    body.extend_from_slice(random);
    body.push(0x00); // session id: empty
    body.extend_from_slice(&[0x00, 0x02]);
    body.extend_from_slice(&TLS_RSA_WITH_AES_128_CBC_SHA);
    body.extend_from_slice(&[0x01, 0x00]); // compression: null only
    body
}

/// Certificate message body: 24-bit chain length, 24-bit leaf length, DER.
/// Exactly one leaf, no chain.
fn certificate_body(cert: &LeafCertificate) -> Vec<u8> {
    let der = cert.der();
    let leaf_len = der.len() as u32;
    let chain_len = leaf_len + 3;

    let mut body = Vec::with_capacity(6 + der.len());
    body.extend_from_slice(&[(chain_len >> 16) as u8, (chain_len >> 8) as u8, chain_len as u8]);
    body.extend_from_slice(&[(leaf_len >> 16) as u8, (leaf_len >> 8) as u8, leaf_len as u8]);
    body.extend_from_slice(der);
    body
}

// ============================================================================
// Message parsing
// ============================================================================

/// The 32-byte random sits at a fixed offset in a hello body (after the
/// 2-byte version).
fn random_from_hello(message: &[u8]) -> Result<[u8; 32], TlsError> {
    let body = message.get(4..).ok_or(TlsError::Truncated("hello header"))?;
    let slice = body.get(2..34).ok_or(TlsError::Truncated("hello random"))?;
    let mut random = [0u8; 32];
    random.copy_from_slice(slice);
    Ok(random)
}

/// Pull the single leaf out of a Certificate message: skip the 4-byte
/// handshake header and the chain-length prefix, read the per-cert 24-bit
/// length, then the DER bytes.
fn certificate_from_message(message: &[u8]) -> Result<LeafCertificate, TlsError> {
    let body = message.get(4..).ok_or(TlsError::Truncated("certificate header"))?;
    if body.len() < 6 {
        return Err(TlsError::Truncated("certificate lengths"));
    }
    let leaf_len = ((body[3] as usize) << 16) | ((body[4] as usize) << 8) | body[5] as usize;
    let der = body
        .get(6..6 + leaf_len)
        .ok_or(TlsError::Truncated("certificate body"))?;
    LeafCertificate::from_der(der)
}

/// ClientKeyExchange body: u16 length then the RSA ciphertext of the
/// pre-master secret.
fn pre_master_from_message(
    message: &[u8],
    key: &RsaPrivateKey,
) -> Result<[u8; 48], TlsError> {
    let body = message.get(4..).ok_or(TlsError::Truncated("key exchange header"))?;
    if body.len() < 2 {
        return Err(TlsError::Truncated("key exchange body"));
    }
    let decrypted = key
        .decrypt(Pkcs1v15Encrypt, &body[2..])
        .map_err(|e| TlsError::KeyExchange(format!("pre-master decryption failed: {}", e)))?;
    let slice: [u8; 48] = decrypted
        .as_slice()
        .try_into()
        .map_err(|_| TlsError::KeyExchange("pre-master secret is not 48 bytes".to_string()))?;
    Ok(slice)
}

/// Verify a CertificateVerify message against the transcript it signed.
fn check_certificate_verify(
    message: &[u8],
    transcript: &[u8],
    public_key: &RsaPublicKey,
) -> Result<(), TlsError> {
    let body = message.get(4..).ok_or(TlsError::Truncated("certificate verify header"))?;
    if body.len() < 2 {
        return Err(TlsError::Truncated("certificate verify body"));
    }
    let sig_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let signature = body
        .get(2..2 + sig_len)
        .ok_or(TlsError::Truncated("certificate verify signature"))?;

    let digest = Sha256::digest(transcript);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| TlsError::SignatureVerification)
}

/// First 12 bytes of `SHA-256(masterSecret ‖ transcript)`.
fn verify_data(master_secret: &[u8; 48], transcript: &[u8]) -> [u8; VERIFY_DATA_LEN] {
    let mut hash = Sha256::new();
    hash.update(master_secret);
    hash.update(transcript);
    let digest = hash.finalize();
    let mut data = [0u8; VERIFY_DATA_LEN];
    data.copy_from_slice(&digest[..VERIFY_DATA_LEN]);
    data
}

// ============================================================================
// Handshake controllers
// ============================================================================

impl<S> TlsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake for whichever end this connection was constructed
    /// as. Must complete before any application data is exchanged.
    pub async fn handshake(&mut self) -> Result<(), TlsError> {
        match self.params.end {
            ConnectionEnd::Client => self.handshake_client().await,
            ConnectionEnd::Server => self.handshake_server().await,
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Send one handshake message in its own record and append it to the
    /// transcript.
    async fn send_handshake(
        &mut self,
        msg_type: HandshakeType,
        body: &[u8],
    ) -> Result<(), TlsError> {
        let message = handshake_message(msg_type, body);
        self.write_record(ContentType::Handshake, &message).await?;
        self.transcript.extend_from_slice(&message);
        Ok(())
    }

    /// Read one record and require the Handshake content type.
    async fn read_handshake_record(&mut self) -> Result<Vec<u8>, TlsError> {
        let record = self.read_record().await?;
        if record.content_type != ContentType::Handshake {
            return Err(TlsError::UnexpectedContentType {
                expected: ContentType::Handshake,
                got: record.content_type as u8,
            });
        }
        if record.payload.len() < 4 {
            return Err(TlsError::Truncated("handshake message"));
        }
        Ok(record.payload)
    }

    /// Derive the master secret and the key block. Runs exactly once, after
    /// the key exchange is complete on this end and before any encrypted
    /// record is produced or consumed.
    fn change_keys(&mut self, pre_master: &[u8; 48]) {
        self.params.master_secret = derive_master_secret(
            pre_master,
            &self.params.client_random,
            &self.params.server_random,
        );
        self.keys = Some(KeyMaterial::derive(
            self.params.end,
            &self.params.master_secret,
            &self.params.client_random,
            &self.params.server_random,
        ));
    }

    fn remote_public_key(&self) -> Result<&RsaPublicKey, TlsError> {
        self.params
            .remote_cert
            .as_ref()
            .map(|c| c.public_key())
            .ok_or_else(|| TlsError::KeyExchange("peer certificate not received".to_string()))
    }

    /// Encrypt and send our Finished message. Finished is never appended to
    /// the transcript, so both ends compute verify-data over the same bytes.
    async fn send_finished(&mut self) -> Result<(), TlsError> {
        let data = verify_data(&self.params.master_secret, &self.transcript);
        let message = handshake_message(HandshakeType::Finished, &data);
        let protected = self.encrypt_payload(&message)?;
        self.write_record(ContentType::Handshake, &protected).await
    }

    /// Read the peer's ChangeCipherSpec and encrypted Finished, and compare
    /// its verify-data with our own transcript hash.
    async fn receive_change_cipher_and_finished(&mut self) -> Result<(), TlsError> {
        let record = self.read_record().await?;
        if record.content_type != ContentType::ChangeCipherSpec {
            return Err(TlsError::UnexpectedContentType {
                expected: ContentType::ChangeCipherSpec,
                got: record.content_type as u8,
            });
        }

        let record = self.read_record().await?;
        if record.content_type != ContentType::Handshake {
            return Err(TlsError::UnexpectedContentType {
                expected: ContentType::Handshake,
                got: record.content_type as u8,
            });
        }
        let message = self.decrypt_payload(&record.payload)?;
        if message.len() < 4 + VERIFY_DATA_LEN || message[0] != HandshakeType::Finished as u8 {
            return Err(TlsError::InvalidFinished);
        }

        let expected = verify_data(&self.params.master_secret, &self.transcript);
        if message[4..4 + VERIFY_DATA_LEN] != expected {
            return Err(TlsError::InvalidFinished);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    async fn handshake_client(&mut self) -> Result<(), TlsError> {
        random_bytes(&mut self.params.client_random)?;
        let hello = hello_body(&self.params.client_random);
        self.send_handshake(HandshakeType::ClientHello, &hello).await?;
        debug!("client: sent ClientHello");

        self.receive_server_flight().await?;

        let cert_body = certificate_body(&self.params.local_cert);
        self.send_handshake(HandshakeType::Certificate, &cert_body).await?;
        debug!("client: sent Certificate");

        let pre_master = self.send_client_key_exchange().await?;
        self.send_certificate_verify().await?;

        self.change_keys(&pre_master);

        self.write_record(ContentType::ChangeCipherSpec, &[0x01]).await?;
        self.send_finished().await?;
        debug!("client: sent ChangeCipherSpec and Finished");

        self.receive_change_cipher_and_finished().await?;
        debug!("client: handshake complete");
        Ok(())
    }

    /// ServerHello through ServerHelloDone, in one loop. CertificateRequest
    /// is acknowledged implicitly — this implementation always sends a
    /// client certificate.
    async fn receive_server_flight(&mut self) -> Result<(), TlsError> {
        loop {
            let message = self.read_handshake_record().await?;
            self.transcript.extend_from_slice(&message);

            match message[0] {
                t if t == HandshakeType::ServerHello as u8 => {
                    self.params.server_random = random_from_hello(&message)?;
                    debug!("client: received ServerHello");
                }
                t if t == HandshakeType::Certificate as u8 => {
                    self.params.remote_cert = Some(certificate_from_message(&message)?);
                    debug!("client: received server Certificate");
                }
                t if t == HandshakeType::CertificateRequest as u8 => {
                    debug!("client: received CertificateRequest");
                }
                t if t == HandshakeType::ServerHelloDone as u8 => {
                    debug!("client: received ServerHelloDone");
                    return Ok(());
                }
                other => return Err(TlsError::UnexpectedHandshakeType(other)),
            }
        }
    }

    /// Generate the pre-master secret, encrypt it to the server's public key
    /// and send ClientKeyExchange. Returns the plaintext secret for the key
    /// schedule.
    async fn send_client_key_exchange(&mut self) -> Result<[u8; 48], TlsError> {
        let mut pre_master = [0u8; 48];
        pre_master[..2].copy_from_slice(&PROTOCOL_VERSION);
        random_bytes(&mut pre_master[2..])?;

        let encrypted = self
            .remote_public_key()?
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &pre_master)
            .map_err(|e| TlsError::KeyExchange(format!("pre-master encryption failed: {}", e)))?;

        let mut body = Vec::with_capacity(2 + encrypted.len());
        body.extend_from_slice(&(encrypted.len() as u16).to_be_bytes());
        body.extend_from_slice(&encrypted);

        self.send_handshake(HandshakeType::ClientKeyExchange, &body).await?;
        debug!("client: sent ClientKeyExchange");
        Ok(pre_master)
    }

    /// Sign everything exchanged so far to prove possession of the key
    /// behind our certificate.
    async fn send_certificate_verify(&mut self) -> Result<(), TlsError> {
        let digest = Sha256::digest(&self.transcript);
        let signature = self
            .params
            .local_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| TlsError::PrivateKey(format!("transcript signing failed: {}", e)))?;

        let mut body = Vec::with_capacity(2 + signature.len());
        body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        body.extend_from_slice(&signature);

        self.send_handshake(HandshakeType::CertificateVerify, &body).await?;
        debug!("client: sent CertificateVerify");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    async fn handshake_server(&mut self) -> Result<(), TlsError> {
        let message = self.expect_handshake(HandshakeType::ClientHello).await?;
        self.params.client_random = random_from_hello(&message)?;
        debug!("server: received ClientHello");

        random_bytes(&mut self.params.server_random)?;
        let hello = hello_body(&self.params.server_random);
        self.send_handshake(HandshakeType::ServerHello, &hello).await?;
        let cert_body = certificate_body(&self.params.local_cert);
        self.send_handshake(HandshakeType::Certificate, &cert_body).await?;
        self.send_handshake(HandshakeType::CertificateRequest, &[]).await?;
        self.send_handshake(HandshakeType::ServerHelloDone, &[]).await?;
        debug!("server: sent hello flight");

        let message = self.expect_handshake(HandshakeType::Certificate).await?;
        self.params.remote_cert = Some(certificate_from_message(&message)?);
        debug!("server: received client Certificate");

        let message = self.expect_handshake(HandshakeType::ClientKeyExchange).await?;
        let pre_master = pre_master_from_message(&message, &self.params.local_key)?;
        debug!("server: received ClientKeyExchange");

        // CertificateVerify signs the transcript *excluding* itself, so
        // verify first and only then append.
        let message = self.read_handshake_record().await?;
        if message[0] != HandshakeType::CertificateVerify as u8 {
            return Err(TlsError::UnexpectedHandshakeType(message[0]));
        }
        check_certificate_verify(&message, &self.transcript, self.remote_public_key()?)?;
        self.transcript.extend_from_slice(&message);
        debug!("server: verified CertificateVerify");

        self.change_keys(&pre_master);

        self.receive_change_cipher_and_finished().await?;
        debug!("server: received ChangeCipherSpec and Finished");

        self.write_record(ContentType::ChangeCipherSpec, &[0x01]).await?;
        self.send_finished().await?;
        debug!("server: handshake complete");
        Ok(())
    }

    /// Read one handshake message, require the given type, and append it to
    /// the transcript.
    async fn expect_handshake(&mut self, expected: HandshakeType) -> Result<Vec<u8>, TlsError> {
        let message = self.read_handshake_record().await?;
        if message[0] != expected as u8 {
            return Err(TlsError::UnexpectedHandshakeType(message[0]));
        }
        self.transcript.extend_from_slice(&message);
        Ok(message)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::read_private_key_from_file;
    use std::path::Path;

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
    }

    fn server_cert() -> LeafCertificate {
        LeafCertificate::from_pem_file(&fixture("server.crt")).unwrap()
    }

    fn server_key() -> RsaPrivateKey {
        read_private_key_from_file(&fixture("server.key")).unwrap()
    }

    #[test]
    fn handshake_header_is_type_plus_24_bit_length() {
        let msg = handshake_message(HandshakeType::ClientHello, &[0xaa; 300]);
        assert_eq!(msg[0], 0x01);
        assert_eq!(&msg[1..4], &[0x00, 0x01, 0x2c]); // 300
        assert_eq!(msg.len(), 304);
    }

    #[test]
    fn hello_body_layout_is_fixed() {
        let random = [0x42u8; 32];
        let body = hello_body(&random);

        assert_eq!(&body[..2], &PROTOCOL_VERSION);
        assert_eq!(&body[2..34], &random);
        assert_eq!(body[34], 0x00); // empty session id
        assert_eq!(&body[35..37], &[0x00, 0x02]);
        assert_eq!(&body[37..39], &TLS_RSA_WITH_AES_128_CBC_SHA);
        assert_eq!(&body[39..41], &[0x01, 0x00]);
        assert_eq!(body.len(), 41);

        // The peer reads the random back out of the framed message.
        let msg = handshake_message(HandshakeType::ServerHello, &body);
        assert_eq!(random_from_hello(&msg).unwrap(), random);
    }

    #[test]
    fn certificate_message_round_trips_the_leaf() {
        let cert = server_cert();
        let body = certificate_body(&cert);

        let chain_len =
            ((body[0] as usize) << 16) | ((body[1] as usize) << 8) | body[2] as usize;
        let leaf_len =
            ((body[3] as usize) << 16) | ((body[4] as usize) << 8) | body[5] as usize;
        assert_eq!(leaf_len, cert.der().len());
        assert_eq!(chain_len, leaf_len + 3);

        let msg = handshake_message(HandshakeType::Certificate, &body);
        let parsed = certificate_from_message(&msg).unwrap();
        assert_eq!(parsed.der(), cert.der());
    }

    #[test]
    fn empty_flight_messages_are_four_bytes() {
        assert_eq!(
            handshake_message(HandshakeType::CertificateRequest, &[]),
            vec![0x0d, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            handshake_message(HandshakeType::ServerHelloDone, &[]),
            vec![0x0e, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn certificate_verify_accepts_real_signature_and_rejects_flipped_bit() {
        let key = server_key();
        let cert = server_cert();
        let transcript = b"client hello server hello and friends".to_vec();

        let digest = Sha256::digest(&transcript);
        let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        body.extend_from_slice(&signature);
        let msg = handshake_message(HandshakeType::CertificateVerify, &body);

        check_certificate_verify(&msg, &transcript, cert.public_key()).unwrap();

        let mut tampered = msg.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            check_certificate_verify(&tampered, &transcript, cert.public_key()),
            Err(TlsError::SignatureVerification)
        ));

        // Signature over a different transcript also fails.
        assert!(check_certificate_verify(&msg, b"other transcript", cert.public_key()).is_err());
    }

    #[test]
    fn verify_data_is_twelve_transcript_bound_bytes() {
        let master = [5u8; 48];
        let a = verify_data(&master, b"transcript");
        assert_eq!(a, verify_data(&master, b"transcript"));
        assert_ne!(a, verify_data(&master, b"transcript!"));
        assert_ne!(a, verify_data(&[6u8; 48], b"transcript"));
    }

    #[tokio::test]
    async fn full_mutual_handshake_agrees_on_keys() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let mut client = TlsConnection::client(
            client_io,
            &fixture("client.crt"),
            &fixture("client.key"),
        )
        .unwrap();
        let mut server = TlsConnection::server(
            server_io,
            &fixture("server.crt"),
            &fixture("server.key"),
        )
        .unwrap();

        let server_task = tokio::spawn(async move {
            server.handshake().await.unwrap();
            server
        });
        client.handshake().await.unwrap();
        let server = server_task.await.unwrap();

        assert_eq!(client.master_secret(), server.master_secret());
        let ck = client.key_material().unwrap();
        let sk = server.key_material().unwrap();
        assert_eq!(ck.client_write_key, sk.client_write_key);
        assert_eq!(ck.server_write_key, sk.server_write_key);
        assert_eq!(ck.client_mac_key, sk.client_mac_key);
        assert_eq!(ck.client_iv, sk.client_iv);
    }
}
