//! Principals, blessings and authorization seams.
//!
//! The transport does not mint or interpret credentials; it carries
//! already-minted blessing chains at handshake time and verifies that the
//! peer's chain is signed down from a key the local principal recognizes
//! as a root. A blessing chain is a list of certificates: the first is
//! self-signed by the root key, each subsequent one binds an extension
//! name to a subject key under the parent's signature. The chain's name is
//! its extensions joined with `/`, e.g. `root/server`.

use std::collections::HashSet;
use std::fmt;

use bytes::{Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{Error, ErrorKind, Result};
use crate::message::{get_bytes, get_string, get_varint, put_bytes, put_string, put_varint};

const CERT_CONTEXT: &[u8] = b"braid:certificate:";
const BINDING_CONTEXT: &[u8] = b"braid:channel-binding:";

/// One link in a blessing chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// Name extension this certificate adds.
    pub extension: String,
    /// Key the certificate speaks for.
    pub public_key: [u8; 32],
    /// Parent's signature (self-signature for the root certificate).
    pub signature: [u8; 64],
}

fn cert_message(signer_key: &[u8; 32], extension: &str, subject_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CERT_CONTEXT.len() + 32 + extension.len() + 32 + 8);
    msg.extend_from_slice(CERT_CONTEXT);
    msg.extend_from_slice(signer_key);
    msg.extend_from_slice(&(extension.len() as u64).to_le_bytes());
    msg.extend_from_slice(extension.as_bytes());
    msg.extend_from_slice(subject_key);
    msg
}

fn verify_sig(key: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(key) else {
        return false;
    };
    key.verify(msg, &Signature::from_bytes(sig)).is_ok()
}

/// A set of blessing chains, all speaking for the same public key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blessings {
    chains: Vec<Vec<Certificate>>,
}

impl Blessings {
    pub fn none() -> Self {
        Blessings { chains: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// The key every chain speaks for, if any chains exist.
    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.chains
            .first()
            .and_then(|chain| chain.last())
            .map(|cert| cert.public_key)
    }

    /// Human-readable names, one per chain.
    pub fn names(&self) -> Vec<String> {
        self.chains
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|c| c.extension.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect()
    }

    /// The key a chain is rooted at.
    fn root_key(chain: &[Certificate]) -> Option<[u8; 32]> {
        chain.first().map(|c| c.public_key)
    }

    /// Whether every signature in the chain checks out.
    fn chain_valid(chain: &[Certificate]) -> bool {
        let Some(root) = chain.first() else {
            return false;
        };
        if !verify_sig(
            &root.public_key,
            &cert_message(&root.public_key, &root.extension, &root.public_key),
            &root.signature,
        ) {
            return false;
        }
        for pair in chain.windows(2) {
            let (parent, child) = (&pair[0], &pair[1]);
            if !verify_sig(
                &parent.public_key,
                &cert_message(&parent.public_key, &child.extension, &child.public_key),
                &child.signature,
            ) {
                return false;
            }
        }
        true
    }

    /// Wire form: varint chain count, then per chain a varint certificate
    /// count and the certificates (extension, key, signature).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, self.chains.len() as u64);
        for chain in &self.chains {
            put_varint(&mut buf, chain.len() as u64);
            for cert in chain {
                put_string(&mut buf, &cert.extension);
                put_bytes(&mut buf, &cert.public_key);
                put_bytes(&mut buf, &cert.signature);
            }
        }
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Blessings> {
        let bad = || Error::new(ErrorKind::HandshakeFailure, "malformed blessings");
        let mut buf = Bytes::copy_from_slice(raw);
        let nchains = get_varint(&mut buf, "blessings")? as usize;
        if nchains > 16 {
            return Err(bad());
        }
        let mut chains = Vec::with_capacity(nchains);
        for _ in 0..nchains {
            let ncerts = get_varint(&mut buf, "blessing chain")? as usize;
            if ncerts == 0 || ncerts > 16 {
                return Err(bad());
            }
            let mut chain = Vec::with_capacity(ncerts);
            for _ in 0..ncerts {
                let extension = get_string(&mut buf, "certificate extension")?;
                let public_key: [u8; 32] = get_bytes(&mut buf, "certificate key")?
                    .as_ref()
                    .try_into()
                    .map_err(|_| bad())?;
                let signature: [u8; 64] = get_bytes(&mut buf, "certificate signature")?
                    .as_ref()
                    .try_into()
                    .map_err(|_| bad())?;
                chain.push(Certificate {
                    extension,
                    public_key,
                    signature,
                });
            }
            chain_ok(&chain, &chains).ok_or_else(bad)?;
            chains.push(chain);
        }
        return Ok(Blessings { chains });

        // All chains must speak for the same leaf key.
        fn chain_ok(chain: &[Certificate], existing: &[Vec<Certificate>]) -> Option<()> {
            let leaf = chain.last()?.public_key;
            match existing.first().and_then(|c| c.last()) {
                Some(prev) if prev.public_key != leaf => None,
                _ => Some(()),
            }
        }
    }
}

impl fmt::Display for Blessings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

/// A signing identity with a default blessing set and a store of
/// recognized roots.
pub struct Principal {
    signing: SigningKey,
    blessings: Blessings,
    roots: HashSet<[u8; 32]>,
}

impl Principal {
    /// A principal whose only blessing is a self-signed name.
    pub fn self_blessed(name: &str) -> Principal {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let public = signing.verifying_key().to_bytes();
        let sig = signing.sign(&cert_message(&public, name, &public));
        let chain = vec![Certificate {
            extension: name.to_string(),
            public_key: public,
            signature: sig.to_bytes(),
        }];
        let mut roots = HashSet::new();
        roots.insert(public);
        Principal {
            signing,
            blessings: Blessings {
                chains: vec![chain],
            },
            roots,
        }
    }

    /// A principal with a key but no blessings yet.
    pub fn unblessed() -> Principal {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Principal {
            signing,
            blessings: Blessings::none(),
            roots: HashSet::new(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn blessings(&self) -> &Blessings {
        &self.blessings
    }

    /// Install blessings minted for this principal's key.
    pub fn adopt_blessings(&mut self, blessings: Blessings) -> Result<()> {
        match blessings.public_key() {
            Some(key) if key == self.public_key() => {
                self.blessings = blessings;
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::HandshakeFailure,
                "blessings do not speak for this principal's key",
            )),
        }
    }

    /// Extend this principal's blessings onto `subject_key` under
    /// `extension`, e.g. a root blessing a server as `root/server`.
    pub fn bless(&self, subject_key: [u8; 32], extension: &str) -> Blessings {
        let chains = self
            .blessings
            .chains
            .iter()
            .map(|chain| {
                let sig = self
                    .signing
                    .sign(&cert_message(&self.public_key(), extension, &subject_key));
                let mut extended = chain.clone();
                extended.push(Certificate {
                    extension: extension.to_string(),
                    public_key: subject_key,
                    signature: sig.to_bytes(),
                });
                extended
            })
            .collect();
        Blessings { chains }
    }

    /// Trust blessing chains rooted at `key`.
    pub fn add_root(&mut self, key: [u8; 32]) {
        self.roots.insert(key);
    }

    /// Validate a peer's blessings: every returned name comes from a chain
    /// whose signatures verify and whose root this principal recognizes.
    /// Chains rooted at unrecognized keys are discarded, not an error.
    pub fn verify_peer(&self, blessings: &Blessings) -> Vec<String> {
        blessings
            .chains
            .iter()
            .filter(|chain| Blessings::chain_valid(chain))
            .filter(|chain| {
                Blessings::root_key(chain)
                    .map(|root| self.roots.contains(&root))
                    .unwrap_or(false)
            })
            .map(|chain| {
                chain
                    .iter()
                    .map(|c| c.extension.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect()
    }

    /// Sign a handshake channel binding with this principal's key.
    pub fn sign_binding(&self, binding: &[u8; 32]) -> [u8; 64] {
        let mut msg = Vec::with_capacity(BINDING_CONTEXT.len() + 32);
        msg.extend_from_slice(BINDING_CONTEXT);
        msg.extend_from_slice(binding);
        self.signing.sign(&msg).to_bytes()
    }
}

/// Check a binding signature against the key a blessing set speaks for.
pub fn verify_binding(key: &[u8; 32], binding: &[u8; 32], sig: &[u8]) -> bool {
    let Ok(sig) = <[u8; 64]>::try_from(sig) else {
        return false;
    };
    let mut msg = Vec::with_capacity(BINDING_CONTEXT.len() + 32);
    msg.extend_from_slice(BINDING_CONTEXT);
    msg.extend_from_slice(binding);
    verify_sig(key, &msg, &sig)
}

/// An opaque third-party caveat discharge, transported but not evaluated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Discharge {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Wire form for a discharge list.
pub fn encode_discharges(discharges: &[Discharge]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_varint(&mut buf, discharges.len() as u64);
    for d in discharges {
        put_string(&mut buf, &d.id);
        put_bytes(&mut buf, &d.payload);
    }
    buf.to_vec()
}

pub fn decode_discharges(raw: &[u8]) -> Result<Vec<Discharge>> {
    let mut buf = Bytes::copy_from_slice(raw);
    let n = get_varint(&mut buf, "discharges")? as usize;
    if n > 64 {
        return Err(Error::new(ErrorKind::HandshakeFailure, "too many discharges"));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(Discharge {
            id: get_string(&mut buf, "discharge id")?,
            payload: get_bytes(&mut buf, "discharge payload")?.to_vec(),
        });
    }
    Ok(out)
}

/// A pattern over blessing names: components must prefix-match, and a
/// trailing `$` demands an exact match. `root` matches `root/server`;
/// `root/server/$` matches only `root/server`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlessingPattern {
    components: Vec<String>,
    exact: bool,
}

impl BlessingPattern {
    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('/').collect();
        if self.exact && parts.len() != self.components.len() {
            return false;
        }
        if parts.len() < self.components.len() {
            return false;
        }
        self.components
            .iter()
            .zip(parts.iter())
            .all(|(pat, part)| pat == part)
    }

    pub fn matches_any(&self, names: &[String]) -> bool {
        names.iter().any(|n| self.matches(n))
    }
}

impl std::str::FromStr for BlessingPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<BlessingPattern> {
        let (body, exact) = match s.strip_suffix("/$") {
            Some(body) => (body, true),
            None => (s, false),
        };
        if body.is_empty() || body.split('/').any(str::is_empty) {
            return Err(Error::new(
                ErrorKind::AuthorizationDenied,
                format!("bad blessing pattern {:?}", s),
            ));
        }
        Ok(BlessingPattern {
            components: body.split('/').map(str::to_string).collect(),
            exact,
        })
    }
}

/// Policy applied by a dialer to the blessing names a server presented.
pub trait ServerAuthorizer: Send + Sync {
    fn authorize(&self, remote_names: &[String]) -> Result<()>;
}

/// Authorize servers whose name matches any of a pattern list.
pub struct PatternAuthorizer {
    pub allowed: Vec<BlessingPattern>,
}

impl ServerAuthorizer for PatternAuthorizer {
    fn authorize(&self, remote_names: &[String]) -> Result<()> {
        if self.allowed.iter().any(|p| p.matches_any(remote_names)) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::AuthorizationDenied,
                format!(
                    "authorization error: server blessings [{}] match no allowed pattern",
                    remote_names.join(",")
                ),
            ))
        }
    }
}

impl<F> ServerAuthorizer for F
where
    F: Fn(&[String]) -> Result<()> + Send + Sync,
{
    fn authorize(&self, remote_names: &[String]) -> Result<()> {
        self(remote_names)
    }
}
