//! Caller identity resolution.
//!
//! Authenticated callers are keyed by principal id. Anonymous callers are
//! keyed by a hash of their network address so raw addresses are never
//! persisted in the store.

use std::net::SocketAddr;

use sha2::{Digest, Sha256};

/// Header carrying the forwarded-address chain.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Address used when nothing about the caller's origin is known.
const UNKNOWN_ADDRESS: &str = "unknown";

/// Number of hex characters kept from the keyed digest.
const KEYED_HASH_LEN: usize = 16;

/// Request extension set by an upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPrincipal(pub String);

/// What the resolver can learn about a caller.
pub trait CallerInfo {
    /// Authenticated principal id, if any.
    fn principal_id(&self) -> Option<String>;
    /// Raw forwarded-address chain, client first.
    fn forwarded_for(&self) -> Option<String>;
    /// Direct connection address.
    fn remote_addr(&self) -> Option<String>;
}

/// Plain caller description, e.g. decoded from a gRPC request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub principal_id: Option<String>,
    pub forwarded_for: Option<String>,
    pub remote_addr: Option<String>,
}

impl Caller {
    pub fn authenticated(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: Some(principal_id.into()),
            ..Self::default()
        }
    }

    pub fn anonymous(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            ..Self::default()
        }
    }

    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }
}

impl CallerInfo for Caller {
    fn principal_id(&self) -> Option<String> {
        self.principal_id.clone()
    }

    fn forwarded_for(&self) -> Option<String> {
        self.forwarded_for.clone()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

impl<B> CallerInfo for http::Request<B> {
    fn principal_id(&self) -> Option<String> {
        self.extensions()
            .get::<AuthenticatedPrincipal>()
            .map(|p| p.0.clone())
    }

    fn forwarded_for(&self) -> Option<String> {
        self.headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn remote_addr(&self) -> Option<String> {
        let extensions = self.extensions();
        extensions
            .get::<SocketAddr>()
            .copied()
            .or_else(|| {
                extensions
                    .get::<tonic::transport::server::TcpConnectInfo>()
                    .and_then(|info| info.remote_addr())
            })
            .map(|addr| addr.ip().to_string())
    }
}

/// Hash applied to network addresses before they are used as identifiers.
#[derive(Clone)]
pub enum AddressHasher {
    /// Stable 32-bit polynomial hash, base-36. Not resistant to reconstruction.
    Plain,
    /// SHA-256 over a secret key and the address.
    Keyed(Vec<u8>),
}

impl AddressHasher {
    pub fn keyed(key: impl AsRef<[u8]>) -> Self {
        AddressHasher::Keyed(key.as_ref().to_vec())
    }

    pub fn hash(&self, address: &str) -> String {
        match self {
            AddressHasher::Plain => plain_hash(address),
            AddressHasher::Keyed(key) => {
                let mut hasher = Sha256::new();
                hasher.update(key);
                hasher.update(b":");
                hasher.update(address.as_bytes());
                let digest = format!("{:x}", hasher.finalize());
                digest[..KEYED_HASH_LEN].to_string()
            }
        }
    }
}

impl std::fmt::Debug for AddressHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the key
        match self {
            AddressHasher::Plain => f.write_str("Plain"),
            AddressHasher::Keyed(_) => f.write_str("Keyed(..)"),
        }
    }
}

impl Default for AddressHasher {
    fn default() -> Self {
        AddressHasher::Plain
    }
}

fn plain_hash(input: &str) -> String {
    let mut hash: i32 = 0;
    for c in input.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32);
    }
    to_base36(u64::from(hash.unsigned_abs()))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Derives stable rate limit identifiers from callers.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    hasher: AddressHasher,
}

impl IdentityResolver {
    pub fn new(hasher: AddressHasher) -> Self {
        Self { hasher }
    }

    /// Resolve a caller to `user:<id>` or `ip:<hash>`. Never fails.
    pub fn resolve<C: CallerInfo + ?Sized>(&self, caller: &C) -> String {
        if let Some(id) = non_empty(caller.principal_id()) {
            return format!("user:{}", id);
        }

        let address = caller
            .forwarded_for()
            .and_then(|chain| chain.split(',').next().map(str::to_string))
            .and_then(|first| non_empty(Some(first)))
            .or_else(|| non_empty(caller.remote_addr()))
            .map(|addr| strip_port(&addr))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

        format!("ip:{}", self.hasher.hash(&address))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Connections from one host differ only by port; key on the host.
fn strip_port(address: &str) -> String {
    address
        .parse::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| address.to_string())
}
