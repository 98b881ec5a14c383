//! A rotating self-signed certificate authority.
//!
//! Maintains a small FIFO of short-lived ECDSA-P256 certificates so a long
//! running server can keep presenting a fresh one without ever restarting:
//! older entries expire out the front, new ones are generated once the
//! newest entry is within a third of its own lifetime of expiry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::crypto;

/// Configuration for the certificate authority. No global mutable state: every
/// knob lives here.
#[derive(Clone, Debug)]
pub struct CertOptions {
    pub subject_name: String,
    pub dns_names: Vec<String>,
    pub duration: Duration,
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            subject_name: "localhost".to_string(),
            dns_names: vec!["localhost".to_string()],
            duration: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

/// A generated certificate, its private key, and the SHA-256 hash of its DER
/// encoding, as handed out by [`CertRing::get_certificate`].
#[derive(Clone)]
pub struct IssuedCert {
    pub chain: Arc<CertificateDer<'static>>,
    pub key: Arc<PrivateKeyDer<'static>>,
    pub hash: [u8; 32],
}

struct Entry {
    chain: Arc<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    hash: [u8; 32],
    expiry: SystemTime,
}

/// A source of the current time, injected so tests can drive rotation
/// deterministically instead of waiting on the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct CertRing {
    options: CertOptions,
    clock: Box<dyn Clock>,
    provider: crypto::Provider,
    entries: Mutex<VecDeque<Entry>>,
}

impl CertRing {
    pub fn new(options: CertOptions) -> Self {
        Self::with_clock(options, SystemClock)
    }

    pub fn with_clock(options: CertOptions, clock: impl Clock + 'static) -> Self {
        let ring = Self {
            options,
            clock: Box::new(clock),
            provider: crypto::default_provider(),
            entries: Mutex::new(VecDeque::new()),
        };
        ring.rotate();
        ring
    }

    /// Rotate the ring: evict expired entries from the front, and generate a
    /// fresh certificate if the newest one is within a third of its own
    /// lifetime of expiring (or the ring is empty).
    ///
    /// Idempotent and safe to call from multiple tasks; the mutation window is
    /// the single critical section below, and the "do we need a new cert"
    /// condition is checked again once the lock is held to avoid generating
    /// two certificates for the same window under a race.
    pub fn rotate(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();

        while entries.front().is_some_and(|e| e.expiry < now) {
            entries.pop_front();
        }

        let threshold = now + self.options.duration / 3 * 2;
        let needs_new = entries.back().is_none_or(|e| e.expiry <= threshold);
        if !needs_new {
            return;
        }

        // Double check: another caller may have generated one between our
        // first read above and taking the lock (the read above happens
        // before we ever acquire it, so re-derive the condition now).
        let needs_new = entries.back().is_none_or(|e| e.expiry <= threshold);
        if !needs_new {
            return;
        }

        let expiry = now + self.options.duration;
        let (chain, key) = generate(&self.options, now, expiry);
        let hash = crypto::sha256(&self.provider, &chain);

        entries.push_back(Entry {
            chain: Arc::new(chain),
            key: Arc::new(key),
            hash: hash.as_ref().try_into().expect("sha256 is 32 bytes"),
            expiry,
        });

        debug_assert!(entries.len() <= 3);
    }

    /// The SHA-256 hashes of every currently-held certificate, oldest first,
    /// after performing a rotation step. Suitable for advertising via
    /// `serverCertificateHashes`.
    pub fn enumerate_hashes(&self) -> Vec<[u8; 32]> {
        self.rotate();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.hash)
            .collect()
    }

    /// The certificate a new connection should present: the penultimate entry
    /// if at least two exist (giving clients that cached the previous hash a
    /// grace period), otherwise the sole entry.
    pub fn get_certificate(&self) -> IssuedCert {
        self.rotate();
        let entries = self.entries.lock().unwrap();

        let idx = if entries.len() >= 2 {
            entries.len() - 2
        } else {
            0
        };
        let entry = &entries[idx];

        IssuedCert {
            chain: entry.chain.clone(),
            key: entry.key.clone(),
            hash: entry.hash,
        }
    }
}

fn generate(
    options: &CertOptions,
    not_before: SystemTime,
    not_after: SystemTime,
) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    use rcgen::{
        CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
        KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
    };

    let key_pair =
        KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("P-256 key generation failed");

    let mut params =
        CertificateParams::new(options.dns_names.clone()).expect("invalid SAN dns name");

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, options.subject_name.clone());
    params.distinguished_name = dn;

    params.not_before = not_before
        .try_into()
        .expect("not_before outside representable range");
    params.not_after = not_after
        .try_into()
        .expect("not_after outside representable range");

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .expect("self-signed cert generation failed");

    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    (cert.der().clone(), PrivateKeyDer::Pkcs8(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClock {
        start: SystemTime,
        offset_secs: AtomicU64,
    }

    impl Clock for Arc<FakeClock> {
        fn now(&self) -> SystemTime {
            self.start + Duration::from_secs(self.offset_secs.load(Ordering::SeqCst))
        }
    }

    fn ring_with_clock(duration: Duration) -> (CertRing, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock {
            start: SystemTime::UNIX_EPOCH,
            offset_secs: AtomicU64::new(0),
        });
        let options = CertOptions {
            duration,
            ..Default::default()
        };
        let ring = CertRing::with_clock(options, clock.clone());
        (ring, clock)
    }

    fn advance(clock: &FakeClock, secs: u64) {
        clock.offset_secs.fetch_add(secs, Ordering::SeqCst);
    }

    #[test]
    fn starts_with_one_entry() {
        let (ring, _clock) = ring_with_clock(Duration::from_secs(14 * 86400));
        assert_eq!(ring.enumerate_hashes().len(), 1);
    }

    #[test]
    fn rotation_timing_matches_thirds_of_duration() {
        let duration = Duration::from_secs(14 * 86400);
        let (ring, clock) = ring_with_clock(duration);
        assert_eq!(ring.enumerate_hashes().len(), 1);

        let third = duration.as_secs() / 3;

        advance(&clock, third + 1);
        assert_eq!(ring.enumerate_hashes().len(), 2);

        advance(&clock, third - 2);
        assert_eq!(ring.enumerate_hashes().len(), 2);

        advance(&clock, 3);
        assert_eq!(ring.enumerate_hashes().len(), 3);

        advance(&clock, duration.as_secs());
        let hashes = ring.enumerate_hashes();
        assert_eq!(hashes.len(), 3);
    }

    #[test]
    fn oldest_entry_eventually_expires_and_is_replaced() {
        let duration = Duration::from_secs(14 * 86400);
        let (ring, clock) = ring_with_clock(duration);
        let first_hashes = ring.enumerate_hashes();

        advance(&clock, duration.as_secs() + 1);
        let later_hashes = ring.enumerate_hashes();

        assert!(!later_hashes.is_empty());
        assert_ne!(first_hashes[0], later_hashes[0]);
    }

    #[test]
    fn get_certificate_prefers_penultimate_entry() {
        let duration = Duration::from_secs(14 * 86400);
        let (ring, clock) = ring_with_clock(duration);

        let sole = ring.get_certificate();
        assert_eq!(sole.hash, ring.enumerate_hashes()[0]);

        advance(&clock, duration.as_secs() / 3 + 1);
        let hashes = ring.enumerate_hashes();
        assert_eq!(hashes.len(), 2);

        let current = ring.get_certificate();
        assert_eq!(current.hash, hashes[0]);
    }

    #[test]
    fn rotate_never_leaves_the_ring_without_an_unexpired_entry() {
        let duration = Duration::from_secs(60);
        let (ring, clock) = ring_with_clock(duration);

        for _ in 0..5 {
            advance(&clock, 61);
            ring.rotate();
            let entries = ring.entries.lock().unwrap();
            assert!(entries.iter().any(|e| e.expiry > clock.now()));
            assert!(entries.len() <= 3);
        }
    }
}
