//! Signed router contact.
//!
//! Canonical encoding (little-endian), covered by the signature:
//! ```text
//! version (1) | pubkey (32) | last_updated (8) | n_addrs (1)
//! per address: rank (2) | dialect_len (1) | dialect | ip_kind (1: 4|6) | ip | port (2)
//! ```
//! The wire form appends the 64-byte Ed25519 signature.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::{
    ContactError, DecodeError, RouterId, CONTACT_CLOCK_SKEW, CONTACT_VERSION, MAX_CONTACT_ADDRS,
    MAX_DIALECT_LEN, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::crypto::verify_signature;

use super::BufferSigner;

/// Milliseconds since the UNIX epoch, as stamped into contacts.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One reachable address of a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressInfo {
    /// Network address (IP + port).
    pub addr: SocketAddr,
    /// Transport dialect tag, e.g. `"iwp"`.
    pub dialect: String,
    /// Preference; lower is preferred.
    pub rank: u16,
}

impl AddressInfo {
    /// Address reachable over the IWP dialect.
    pub fn iwp(addr: SocketAddr, rank: u16) -> Self {
        Self {
            addr,
            dialect: "iwp".to_string(),
            rank,
        }
    }
}

/// A signed, versioned record binding a router identity to its addresses.
///
/// Immutable once signed: a router that changes addresses publishes a new,
/// newer contact instead of editing this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterContact {
    version: u8,
    pubkey: RouterId,
    addrs: Vec<AddressInfo>,
    last_updated: u64,
    signature: [u8; SIGNATURE_SIZE],
}

impl RouterContact {
    /// Build and sign a contact for `signer`'s identity.
    pub fn sign(
        signer: &dyn BufferSigner,
        addrs: Vec<AddressInfo>,
        last_updated: u64,
    ) -> Result<Self, ContactError> {
        let mut contact = Self {
            version: CONTACT_VERSION,
            pubkey: signer.router_id(),
            addrs,
            last_updated,
            signature: [0u8; SIGNATURE_SIZE],
        };
        let body = contact.signed_bytes()?;
        contact.signature = signer.sign(&body);
        Ok(contact)
    }

    /// Identity this contact belongs to.
    pub fn router_id(&self) -> &RouterId {
        &self.pubkey
    }

    /// Advertised addresses, in publication order.
    pub fn addrs(&self) -> &[AddressInfo] {
        &self.addrs
    }

    /// Signing time in milliseconds since the UNIX epoch.
    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }

    /// Document format version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Detached signature.
    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    /// Whether `self` supersedes `other` (same identity, signed later).
    pub fn is_newer_than(&self, other: &RouterContact) -> bool {
        self.pubkey == other.pubkey && self.last_updated > other.last_updated
    }

    /// Check the signature against the embedded key.
    pub fn verify_signature(&self) -> Result<(), ContactError> {
        let body = self.signed_bytes()?;
        verify_signature(&self.pubkey, &body, &self.signature)
            .map_err(|_| ContactError::BadSignature)
    }

    /// Full validity check: signature, expiry and clock skew.
    ///
    /// `now` is in milliseconds since the UNIX epoch.
    pub fn verify(&self, now: u64, max_age: Duration) -> Result<(), ContactError> {
        self.verify_signature()?;

        let skew = CONTACT_CLOCK_SKEW.as_millis() as u64;
        if self.last_updated > now.saturating_add(skew) {
            return Err(ContactError::FromFuture {
                last_updated: self.last_updated,
            });
        }

        let age_ms = now.saturating_sub(self.last_updated);
        if age_ms > max_age.as_millis() as u64 {
            return Err(ContactError::Expired { age_ms });
        }
        Ok(())
    }

    /// The bytes covered by the signature.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, ContactError> {
        if self.addrs.len() > MAX_CONTACT_ADDRS {
            return Err(ContactError::LimitExceeded("too many addresses"));
        }

        let mut buf = Vec::with_capacity(1 + PUBLIC_KEY_SIZE + 8 + 1 + self.addrs.len() * 24);
        buf.push(self.version);
        buf.extend_from_slice(self.pubkey.as_bytes());
        buf.extend_from_slice(&self.last_updated.to_le_bytes());
        buf.push(self.addrs.len() as u8);

        for info in &self.addrs {
            if info.dialect.len() > MAX_DIALECT_LEN {
                return Err(ContactError::LimitExceeded("dialect too long"));
            }
            buf.extend_from_slice(&info.rank.to_le_bytes());
            buf.push(info.dialect.len() as u8);
            buf.extend_from_slice(info.dialect.as_bytes());
            match info.addr.ip() {
                IpAddr::V4(ip) => {
                    buf.push(4);
                    buf.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.push(6);
                    buf.extend_from_slice(&ip.octets());
                }
            }
            buf.extend_from_slice(&info.addr.port().to_le_bytes());
        }
        Ok(buf)
    }

    /// Wire form: canonical encoding followed by the signature.
    pub fn encode(&self) -> Result<Vec<u8>, ContactError> {
        let mut buf = self.signed_bytes()?;
        buf.extend_from_slice(&self.signature);
        Ok(buf)
    }

    /// Decode the wire form. Trailing bytes are rejected.
    ///
    /// Decoding does not verify the signature; call [`RouterContact::verify`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ContactError> {
        let mut reader = Reader::new(bytes);

        let version = reader.u8()?;
        if version != CONTACT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version).into());
        }
        let pubkey = RouterId::from_bytes(reader.array()?);
        let last_updated = reader.u64()?;

        let n_addrs = reader.u8()? as usize;
        if n_addrs > MAX_CONTACT_ADDRS {
            return Err(ContactError::LimitExceeded("too many addresses"));
        }

        let mut addrs = Vec::with_capacity(n_addrs);
        for _ in 0..n_addrs {
            let rank = reader.u16()?;
            let dialect_len = reader.u8()? as usize;
            if dialect_len > MAX_DIALECT_LEN {
                return Err(ContactError::LimitExceeded("dialect too long"));
            }
            let dialect = std::str::from_utf8(reader.take(dialect_len)?)
                .map_err(|_| DecodeError::InvalidEncoding("dialect is not UTF-8".into()))?
                .to_string();
            let ip = match reader.u8()? {
                4 => IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?)),
                6 => IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?)),
                other => {
                    return Err(
                        DecodeError::InvalidEncoding(format!("unknown ip kind {other}")).into(),
                    );
                }
            };
            let port = reader.u16()?;
            addrs.push(AddressInfo {
                addr: SocketAddr::new(ip, port),
                dialect,
                rank,
            });
        }

        let signature = reader.array()?;
        reader.finish()?;

        Ok(Self {
            version,
            pubkey,
            addrs,
            last_updated,
            signature,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.bytes.len() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::LocalIdentity;
    use crate::core::CONTACT_MAX_AGE;
    use crate::crypto::IdentityKeypair;

    const NOW: u64 = 1_700_000_000_000;

    fn addrs() -> Vec<AddressInfo> {
        vec![
            AddressInfo::iwp("192.0.2.7:1090".parse().unwrap(), 1),
            AddressInfo {
                addr: "[2001:db8::1]:1090".parse().unwrap(),
                dialect: "iwp".into(),
                rank: 2,
            },
        ]
    }

    fn signed(last_updated: u64) -> RouterContact {
        let identity = LocalIdentity::with_timestamp(IdentityKeypair::generate(), addrs(), last_updated)
            .unwrap();
        identity.contact().clone()
    }

    #[test]
    fn test_signed_contact_verifies() {
        let contact = signed(NOW);
        assert!(contact.verify(NOW, CONTACT_MAX_AGE).is_ok());
        assert_eq!(contact.version(), CONTACT_VERSION);
        assert_eq!(contact.addrs().len(), 2);
    }

    #[test]
    fn test_encode_decode() {
        let contact = signed(NOW);
        let bytes = contact.encode().unwrap();
        let decoded = RouterContact::decode(&bytes).unwrap();
        assert_eq!(decoded, contact);
        assert!(decoded.verify(NOW, CONTACT_MAX_AGE).is_ok());
    }

    #[test]
    fn test_canonical_layout() {
        let contact = signed(NOW);
        let body = contact.signed_bytes().unwrap();

        assert_eq!(body[0], CONTACT_VERSION);
        assert_eq!(&body[1..33], contact.router_id().as_bytes());
        assert_eq!(&body[33..41], &NOW.to_le_bytes());
        assert_eq!(body[41], 2);
        // rank | dialect_len | "iwp" | 4 | ip | port
        assert_eq!(&body[42..44], &1u16.to_le_bytes());
        assert_eq!(body[44], 3);
        assert_eq!(&body[45..48], b"iwp");
        assert_eq!(body[48], 4);
        assert_eq!(&body[49..53], &[192, 0, 2, 7]);
        assert_eq!(&body[53..55], &1090u16.to_le_bytes());
    }

    #[test]
    fn test_tampered_contact_fails() {
        let mut bytes = signed(NOW).encode().unwrap();
        // flip a bit in the port of the first address
        bytes[53] ^= 0x01;
        let contact = RouterContact::decode(&bytes).unwrap();
        assert_eq!(
            contact.verify(NOW, CONTACT_MAX_AGE),
            Err(ContactError::BadSignature)
        );
    }

    #[test]
    fn test_expired_contact() {
        let contact = signed(NOW);
        let later = NOW + CONTACT_MAX_AGE.as_millis() as u64 + 1;
        assert!(matches!(
            contact.verify(later, CONTACT_MAX_AGE),
            Err(ContactError::Expired { .. })
        ));
    }

    #[test]
    fn test_future_contact() {
        let skew = CONTACT_CLOCK_SKEW.as_millis() as u64;
        assert!(signed(NOW + skew).verify(NOW, CONTACT_MAX_AGE).is_ok());
        assert!(matches!(
            signed(NOW + skew + 1).verify(NOW, CONTACT_MAX_AGE),
            Err(ContactError::FromFuture { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = signed(NOW).encode().unwrap();
        bytes.push(0);
        assert_eq!(
            RouterContact::decode(&bytes),
            Err(ContactError::Decode(DecodeError::TrailingBytes(1)))
        );
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = signed(NOW).encode().unwrap();
        assert_eq!(
            RouterContact::decode(&bytes[..bytes.len() - 1]),
            Err(ContactError::Decode(DecodeError::UnexpectedEof))
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut bytes = signed(NOW).encode().unwrap();
        bytes[0] = 9;
        assert_eq!(
            RouterContact::decode(&bytes),
            Err(ContactError::Decode(DecodeError::UnsupportedVersion(9)))
        );
    }

    #[test]
    fn test_limits() {
        let keypair = IdentityKeypair::generate();
        let too_many = vec![AddressInfo::iwp("127.0.0.1:1".parse().unwrap(), 0); MAX_CONTACT_ADDRS + 1];
        assert_eq!(
            LocalIdentity::with_timestamp(keypair, too_many, NOW).map(|_| ()),
            Err(ContactError::LimitExceeded("too many addresses"))
        );

        let keypair = IdentityKeypair::generate();
        let long_dialect = vec![AddressInfo {
            addr: "127.0.0.1:1".parse().unwrap(),
            dialect: "x".repeat(MAX_DIALECT_LEN + 1),
            rank: 0,
        }];
        assert_eq!(
            LocalIdentity::with_timestamp(keypair, long_dialect, NOW).map(|_| ()),
            Err(ContactError::LimitExceeded("dialect too long"))
        );
    }

    #[test]
    fn test_newer_supersedes() {
        let keypair = IdentityKeypair::from_bytes(&[3u8; 32]);
        let old = LocalIdentity::with_timestamp(keypair, addrs(), NOW).unwrap();
        let keypair = IdentityKeypair::from_bytes(&[3u8; 32]);
        let new = LocalIdentity::with_timestamp(keypair, addrs(), NOW + 1).unwrap();

        assert!(new.contact().is_newer_than(old.contact()));
        assert!(!old.contact().is_newer_than(new.contact()));
        assert!(!signed(NOW + 5).is_newer_than(old.contact()));
    }
}
