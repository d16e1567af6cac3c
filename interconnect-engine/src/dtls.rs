//! DTLS 1.2 server context shared by all media sessions
//!
//! One context per node: certificate and key are loaded once, the protocol
//! version is pinned to DTLS 1.2, the SRTP profile list is announced via
//! use_srtp and HelloVerifyRequest cookies are minted from a rotating
//! keyset. The certificate fingerprint (RFC 8122 rendering) is advertised
//! during every media-connect negotiation and checked by the active peer.
// Copyright 2026 Loopgrid Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{EngineError, EngineResult};
use loopgrid_config::DtlsConfig;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use openssl::x509::{X509, X509NameBuilder};
use rand::Rng;
use rand::RngCore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// MD5 digest size, the size of every cookie we mint
pub const COOKIE_LEN: usize = 16;

/// Which end of the handshake a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// Client side, sends the ClientHello
    Active,
    /// Server side, answers with HelloVerifyRequest and ServerHello
    Passive,
}

/// Rotating HelloVerifyRequest cookie keyset.
///
/// A cookie is the MD5 of one key currently in the set; verification tries
/// every key. The whole set is dropped and redrawn on rotation, so cookies
/// minted before a rotation stop verifying and the client simply receives a
/// fresh HelloVerifyRequest on its next ClientHello.
///
/// The OpenSSL callbacks may fire at any stack depth, so the keyset is only
/// touched through `try_lock`; a missed lock is a skip, never a wait.
#[derive(Debug)]
pub struct CookieKeyset {
    keys: Mutex<Vec<Vec<u8>>>,
    quantity: usize,
    length: usize,
}

impl CookieKeyset {
    pub fn new(quantity: usize, length: usize) -> Arc<CookieKeyset> {
        let keyset = CookieKeyset {
            keys: Mutex::new(Vec::new()),
            quantity,
            length,
        };
        keyset.regenerate();
        Arc::new(keyset)
    }

    /// Drop every key and draw a fresh set
    pub fn regenerate(&self) {
        let mut fresh = Vec::with_capacity(self.quantity);
        for _ in 0..self.quantity {
            let mut key = vec![0u8; self.length];
            rand::thread_rng().fill_bytes(&mut key);
            fresh.push(key);
        }

        match self.keys.try_lock() {
            Ok(mut keys) => *keys = fresh,
            Err(_) => debug!("cookie keyset busy, skipping renewal until next tick"),
        }
    }

    /// MD5 of a randomly chosen key from the current set
    pub fn mint(&self) -> Option<Vec<u8>> {
        let keys = self.keys.try_lock().ok()?;
        if keys.is_empty() {
            return None;
        }
        let key = &keys[rand::thread_rng().gen_range(0..keys.len())];
        let digest = hash(MessageDigest::md5(), key).ok()?;
        Some(digest.to_vec())
    }

    /// True when the cookie is the MD5 of any key still in the set
    pub fn check(&self, cookie: &[u8]) -> bool {
        if cookie.is_empty() {
            return false;
        }
        let keys = match self.keys.try_lock() {
            Ok(keys) => keys,
            Err(_) => return false,
        };
        keys.iter().any(|key| {
            hash(MessageDigest::md5(), key)
                .map(|digest| digest.as_ref() == cookie)
                .unwrap_or(false)
        })
    }
}

/// Node-wide DTLS server configuration
pub struct DtlsContext {
    context: SslContext,
    fingerprint: String,
    cookies: Arc<CookieKeyset>,
    cookie_lifetime: Duration,
}

impl DtlsContext {
    /// Build the context from configuration. Unreadable certificate or key
    /// material is fatal.
    pub fn new(config: &DtlsConfig) -> EngineResult<DtlsContext> {
        let cookies = CookieKeyset::new(config.cookie_quantity(), config.cookie_length());

        let mut builder = SslContext::builder(SslMethod::dtls())?;

        builder.set_certificate_chain_file(&config.certificate)?;
        builder.set_private_key_file(&config.key, openssl::ssl::SslFiletype::PEM)?;
        builder.check_private_key()?;

        builder.set_min_proto_version(Some(SslVersion::DTLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::DTLS1_2))?;

        builder.set_tlsext_use_srtp(config.srtp_profiles())?;

        if let Some(ref file) = config.ca.file {
            builder.set_ca_file(file)?;
        }

        // Both sides authenticate by the signaled fingerprint, so request a
        // peer certificate but leave chain validation to the session.
        builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);

        builder.set_options(SslOptions::COOKIE_EXCHANGE);

        let mint_keys = Arc::clone(&cookies);
        builder.set_cookie_generate_cb(move |_ssl, cookie| match mint_keys.mint() {
            Some(digest) => {
                let len = digest.len().min(cookie.len());
                cookie[..len].copy_from_slice(&digest[..len]);
                Ok(len)
            }
            None => Err(ErrorStack::get()),
        });

        let check_keys = Arc::clone(&cookies);
        builder.set_cookie_verify_cb(move |_ssl, cookie| check_keys.check(cookie));

        let context = builder.build();

        let pem = std::fs::read(&config.certificate).map_err(|e| {
            EngineError::Dtls(format!(
                "cannot read certificate {}: {e}",
                config.certificate.display()
            ))
        })?;
        let cert = X509::from_pem(&pem)?;
        let fingerprint = fingerprint_of_cert(&cert)?;

        info!(
            certificate = %config.certificate.display(),
            fingerprint = %fingerprint,
            "DTLS context ready"
        );

        Ok(DtlsContext {
            context,
            fingerprint,
            cookies,
            cookie_lifetime: config.cookie_lifetime(),
        })
    }

    /// RFC 8122 rendering of the SHA-256 over the node certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The cookie keyset, exposed for rotation and tests
    pub fn cookies(&self) -> &Arc<CookieKeyset> {
        &self.cookies
    }

    /// Fresh SSL handle for a session in the given role
    pub fn new_ssl(&self, role: DtlsRole) -> EngineResult<Ssl> {
        let mut ssl = Ssl::new(&self.context)?;
        match role {
            DtlsRole::Active => ssl.set_connect_state(),
            DtlsRole::Passive => ssl.set_accept_state(),
        }
        Ok(ssl)
    }

    /// Start the periodic keyset rotation. Runs until aborted.
    pub fn spawn_cookie_renewal(&self) -> tokio::task::JoinHandle<()> {
        let cookies = Arc::clone(&self.cookies);
        let lifetime = self.cookie_lifetime;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lifetime);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately, skip it
            ticker.tick().await;

            loop {
                ticker.tick().await;
                cookies.regenerate();
                debug!("DTLS cookie keyset rotated");
            }
        })
    }
}

/// `"<hash-name> XX:XX:…"` per RFC 8122, upper-case hex separated by colons
pub fn fingerprint_rfc8122(hash_name: &str, digest: &[u8]) -> String {
    let hex: Vec<String> = digest.iter().map(|b| format!("{b:02X}")).collect();
    format!("{} {}", hash_name, hex.join(":"))
}

/// SHA-256 fingerprint of a certificate
pub fn fingerprint_of_cert(cert: &X509) -> EngineResult<String> {
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(fingerprint_rfc8122("sha-256", &digest))
}

/// Fingerprint comparison; hex case must not matter
pub fn fingerprint_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Check a signaled RFC 8122 fingerprint against a certificate.
///
/// The hash function is taken from the fingerprint's own hash-name token,
/// so a peer may sign with any of the supported renderings.
pub fn verify_fingerprint(cert: &X509, expected: &str) -> EngineResult<bool> {
    let hash_name = expected.split(' ').next().unwrap_or("");
    let digest_type = match hash_name {
        "sha-1" => MessageDigest::sha1(),
        "sha-256" => MessageDigest::sha256(),
        "sha-512" => MessageDigest::sha512(),
        "md5" => MessageDigest::md5(),
        other => {
            return Err(EngineError::Dtls(format!(
                "unsupported fingerprint hash {other:?}"
            )))
        }
    };

    let digest = cert.digest(digest_type)?;
    Ok(fingerprint_matches(
        &fingerprint_rfc8122(hash_name, &digest),
        expected,
    ))
}

/// Self-signed certificate and key in PEM, for tooling and tests.
///
/// Production nodes load provisioned certificates; this exists so a lab
/// setup can run without a CA.
pub fn generate_self_signed(common_name: &str) -> EngineResult<(Vec<u8>, Vec<u8>)> {
    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial_bn = BigNum::new()?;
    serial_bn.rand(159, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial_bn.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&pkey, MessageDigest::sha256())?;

    let cert = builder.build();
    let cert_pem = cert.to_pem()?;
    let key_pem = pkey.private_key_to_pem_pkcs8()?;

    if cert_pem.is_empty() || key_pem.is_empty() {
        error!("self-signed certificate generation produced empty PEM");
        return Err(EngineError::Dtls("empty PEM output".to_string()));
    }

    Ok((cert_pem, key_pem))
}
