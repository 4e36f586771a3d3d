// Shared vocabulary for the till billing client: request kinds, response
// codes, cancellation tags, and the library error type.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("channel unavailable: {0}")]
    Channel(String),
    #[error("remote call failed with {code:?}: {message}")]
    Call { code: ResponseCode, message: String },
    #[error("config error: {0}")]
    Config(String),
}

/// Category of a billing operation.
///
/// The kind drives routing, cache-key namespacing, and the per-kind default
/// expiration. Mutating kinds are never cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    IsBillingSupported,
    ListPurchases,
    ListSkus,
    Purchase,
    ChangeSubscription,
    Consume,
}

impl RequestKind {
    pub const ALL: [RequestKind; 6] = [
        RequestKind::IsBillingSupported,
        RequestKind::ListPurchases,
        RequestKind::ListSkus,
        RequestKind::Purchase,
        RequestKind::ChangeSubscription,
        RequestKind::Consume,
    ];

    // Ordinals namespace cache keys, so a key is never shared across kinds.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Default cache lifetime for responses of this kind. `None` means the
    /// kind is never cached.
    pub fn default_ttl(self) -> Option<Duration> {
        match self {
            // Support rarely flips; keep it for a day.
            RequestKind::IsBillingSupported => Some(Duration::from_secs(24 * 60 * 60)),
            RequestKind::ListPurchases | RequestKind::ListSkus => {
                Some(Duration::from_secs(15 * 60))
            }
            RequestKind::Purchase | RequestKind::ChangeSubscription | RequestKind::Consume => None,
        }
    }

    /// Kinds whose success (or ownership-conflict error) means the remote
    /// purchase state has diverged from anything cached locally.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            RequestKind::Purchase | RequestKind::ChangeSubscription | RequestKind::Consume
        )
    }

    pub fn is_cacheable(self) -> bool {
        self.default_ttl().is_some()
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::IsBillingSupported => "is_billing_supported",
            RequestKind::ListPurchases => "list_purchases",
            RequestKind::ListSkus => "list_skus",
            RequestKind::Purchase => "purchase",
            RequestKind::ChangeSubscription => "change_subscription",
            RequestKind::Consume => "consume",
        };
        f.write_str(name)
    }
}

/// Closed result-code enumeration.
///
/// Codes below 100 mirror the platform service's own responses; codes at
/// 100 and above are reserved by this library and never appear on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ResponseCode {
    Ok = 0,
    UserCanceled = 1,
    ServiceUnavailable = 2,
    BillingUnavailable = 3,
    ItemUnavailable = 4,
    DeveloperError = 5,
    Failure = 6,
    ItemAlreadyOwned = 7,
    ItemNotOwned = 8,
    // Library-reserved codes.
    ChannelNotConnected = 100,
    CallFailed = 101,
    MalformedResult = 102,
}

impl ResponseCode {
    /// Map a raw platform code. Anything outside the closed set is reported
    /// as a malformed external result rather than coerced to a neighbor.
    pub fn from_raw(raw: i32) -> ResponseCode {
        match raw {
            0 => ResponseCode::Ok,
            1 => ResponseCode::UserCanceled,
            2 => ResponseCode::ServiceUnavailable,
            3 => ResponseCode::BillingUnavailable,
            4 => ResponseCode::ItemUnavailable,
            5 => ResponseCode::DeveloperError,
            6 => ResponseCode::Failure,
            7 => ResponseCode::ItemAlreadyOwned,
            8 => ResponseCode::ItemNotOwned,
            _ => ResponseCode::MalformedResult,
        }
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn is_library_code(self) -> bool {
        self.raw() >= 100
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }
}

/// Result of one remote billing call. The payload stays opaque; parsing
/// individual purchase/SKU records happens above this library.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub code: ResponseCode,
    pub payload: Bytes,
}

impl Response {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            code: ResponseCode::Ok,
            payload,
        }
    }

    pub fn code_only(code: ResponseCode) -> Self {
        Self {
            code,
            payload: Bytes::new(),
        }
    }
}

/// Opaque correlation value for bulk cancellation.
///
/// Tags compare structurally; two tags built from the same text match even
/// when they are distinct allocations. An absent tag is not a wildcard:
/// cancelling with `None` touches only untagged requests.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Tag(Arc<str>);

impl Tag {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
