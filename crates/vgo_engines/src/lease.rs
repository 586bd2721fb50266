#![forbid(unsafe_code)]

use subtle::ConstantTimeEq;
use vgo_kernel_contracts::ids::{WindowId, WriterId};
use vgo_kernel_contracts::window::{LeaseOperation, WriterLease};
use vgo_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};

use crate::digest::sha256_tagged_hex;

pub mod reason_codes {
    use vgo_kernel_contracts::ReasonCodeId;

    pub const LEASE_OK_GRANTED: ReasonCodeId = ReasonCodeId(0x4C53_0001);
    pub const LEASE_OK_TAKEOVER: ReasonCodeId = ReasonCodeId(0x4C53_0002);
    pub const LEASE_OK_RELEASED: ReasonCodeId = ReasonCodeId(0x4C53_0003);

    pub const LEASE_HELD_BY_OTHER: ReasonCodeId = ReasonCodeId(0x4C53_0010);
    pub const LEASE_TOKEN_INVALID: ReasonCodeId = ReasonCodeId(0x4C53_0011);
    pub const LEASE_TTL_OUT_OF_BOUNDS: ReasonCodeId = ReasonCodeId(0x4C53_0012);
    pub const LEASE_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x4C53_0013);
    pub const LEASE_EXPIRED: ReasonCodeId = ReasonCodeId(0x4C53_0014);
}

const LEASE_TOKEN_TAG: &[u8] = b"vgo.lease.v1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub min_ttl_ms: u32,
    pub max_ttl_ms: u32,
}

impl LeaseConfig {
    pub fn mvp_v1() -> Self {
        Self {
            min_ttl_ms: 1_000,
            max_ttl_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseRequest<'a> {
    pub window_id: &'a WindowId,
    pub writer_id: &'a WriterId,
    pub operation: LeaseOperation,
    pub requested_ttl_ms: u32,
    pub now: MonotonicTimeNs,
    pub presented_token: Option<&'a str>,
    pub active: Option<&'a WriterLease>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// `lease` is the row to store; `None` clears the slot.
    Granted {
        reason_code: ReasonCodeId,
        lease: Option<WriterLease>,
        takeover: bool,
    },
    Denied {
        reason_code: ReasonCodeId,
        held_by: Option<WriterId>,
        held_until: Option<MonotonicTimeNs>,
    },
}

impl LeaseDecision {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            LeaseDecision::Granted { reason_code, .. } | LeaseDecision::Denied { reason_code, .. } => {
                *reason_code
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseRuntime {
    config: LeaseConfig,
}

impl LeaseRuntime {
    pub fn new(config: LeaseConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, req: &LeaseRequest<'_>) -> LeaseDecision {
        let active = req.active;
        let lease_expired = active.map(|l| !l.is_live(req.now)).unwrap_or(false);
        let owner_match = active
            .map(|l| l.writer_id == *req.writer_id)
            .unwrap_or(false);
        let token_match = active
            .zip(req.presented_token)
            .map(|(l, presented)| bool::from(l.lease_token.as_bytes().ct_eq(presented.as_bytes())))
            .unwrap_or(false);
        let ttl_in_bounds = req.requested_ttl_ms >= self.config.min_ttl_ms
            && req.requested_ttl_ms <= self.config.max_ttl_ms;

        let deny_held = || LeaseDecision::Denied {
            reason_code: reason_codes::LEASE_HELD_BY_OTHER,
            held_by: active.map(|l| l.writer_id.clone()),
            held_until: active.map(|l| l.expires_at),
        };
        let deny = |reason_code| LeaseDecision::Denied {
            reason_code,
            held_by: None,
            held_until: None,
        };

        match req.operation {
            LeaseOperation::Claim => {
                if !ttl_in_bounds {
                    return deny(reason_codes::LEASE_TTL_OUT_OF_BOUNDS);
                }
                match active {
                    Some(l) if !lease_expired && owner_match => {
                        // Re-claim by the holder extends and keeps the token.
                        self.grant(req, l.lease_token.clone(), false)
                    }
                    Some(_) if !lease_expired => deny_held(),
                    Some(_) => self.grant(req, stable_lease_token(req), true),
                    None => self.grant(req, stable_lease_token(req), false),
                }
            }
            LeaseOperation::Renew => {
                if !ttl_in_bounds {
                    return deny(reason_codes::LEASE_TTL_OUT_OF_BOUNDS);
                }
                match active {
                    None => deny(reason_codes::LEASE_NOT_FOUND),
                    Some(_) if !owner_match => deny_held(),
                    Some(_) if !token_match => deny(reason_codes::LEASE_TOKEN_INVALID),
                    Some(_) if lease_expired => deny(reason_codes::LEASE_EXPIRED),
                    Some(l) => self.grant(req, l.lease_token.clone(), false),
                }
            }
            LeaseOperation::Release => match active {
                None => deny(reason_codes::LEASE_NOT_FOUND),
                Some(_) if !owner_match => deny_held(),
                Some(_) if !token_match => deny(reason_codes::LEASE_TOKEN_INVALID),
                Some(_) => LeaseDecision::Granted {
                    reason_code: reason_codes::LEASE_OK_RELEASED,
                    lease: None,
                    takeover: false,
                },
            },
        }
    }

    fn grant(&self, req: &LeaseRequest<'_>, token: String, takeover: bool) -> LeaseDecision {
        let expires_at = MonotonicTimeNs(
            req.now
                .0
                .saturating_add(u64::from(req.requested_ttl_ms) * 1_000_000),
        );
        match WriterLease::v1(req.writer_id.clone(), token, expires_at) {
            Ok(lease) => LeaseDecision::Granted {
                reason_code: if takeover {
                    reason_codes::LEASE_OK_TAKEOVER
                } else {
                    reason_codes::LEASE_OK_GRANTED
                },
                lease: Some(lease),
                takeover,
            },
            Err(_) => LeaseDecision::Denied {
                reason_code: reason_codes::LEASE_TTL_OUT_OF_BOUNDS,
                held_by: None,
                held_until: None,
            },
        }
    }
}

/// True when `writer_id` holds `lease` and presents its token.
pub fn holds_lease(lease: &WriterLease, writer_id: &WriterId, presented_token: &str) -> bool {
    lease.writer_id == *writer_id
        && bool::from(lease.lease_token.as_bytes().ct_eq(presented_token.as_bytes()))
}

fn stable_lease_token(req: &LeaseRequest<'_>) -> String {
    let now = req.now.0.to_string();
    let ttl = req.requested_ttl_ms.to_string();
    let digest = sha256_tagged_hex(
        LEASE_TOKEN_TAG,
        &[
            req.window_id.as_str().as_bytes(),
            req.writer_id.as_str().as_bytes(),
            now.as_bytes(),
            ttl.as_bytes(),
        ],
    );
    format!("lease_{}", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_id() -> WindowId {
        WindowId::parse("w:tenant_a:p0000:1:v1").unwrap()
    }

    fn writer(id: &str) -> WriterId {
        WriterId::new(id).unwrap()
    }

    fn request<'a>(
        window_id: &'a WindowId,
        writer_id: &'a WriterId,
        operation: LeaseOperation,
        now_ns: u64,
        presented_token: Option<&'a str>,
        active: Option<&'a WriterLease>,
    ) -> LeaseRequest<'a> {
        LeaseRequest {
            window_id,
            writer_id,
            operation,
            requested_ttl_ms: 60_000,
            now: MonotonicTimeNs(now_ns),
            presented_token,
            active,
        }
    }

    fn granted_lease(decision: LeaseDecision) -> WriterLease {
        match decision {
            LeaseDecision::Granted {
                lease: Some(lease), ..
            } => lease,
            other => panic!("expected granted lease, got {other:?}"),
        }
    }

    #[test]
    fn at_lease_01_one_writer_per_window() {
        let rt = LeaseRuntime::new(LeaseConfig::mvp_v1());
        let wid = window_id();
        let a = writer("writer_a");
        let b = writer("writer_b");
        let lease_a = granted_lease(rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Claim,
            1_000_000,
            None,
            None,
        )));

        let out = rt.decide(&request(
            &wid,
            &b,
            LeaseOperation::Claim,
            2_000_000,
            None,
            Some(&lease_a),
        ));
        match out {
            LeaseDecision::Denied {
                reason_code,
                held_by,
                held_until,
            } => {
                assert_eq!(reason_code, reason_codes::LEASE_HELD_BY_OTHER);
                assert_eq!(held_by, Some(a.clone()));
                assert_eq!(held_until, Some(lease_a.expires_at));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn at_lease_02_expired_lease_can_be_taken_over() {
        let rt = LeaseRuntime::new(LeaseConfig::mvp_v1());
        let wid = window_id();
        let a = writer("writer_a");
        let b = writer("writer_b");
        let lease_a = granted_lease(rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Claim,
            1_000_000,
            None,
            None,
        )));
        let after_expiry = lease_a.expires_at.0 + 1;
        let out = rt.decide(&request(
            &wid,
            &b,
            LeaseOperation::Claim,
            after_expiry,
            None,
            Some(&lease_a),
        ));
        assert_eq!(out.reason_code(), reason_codes::LEASE_OK_TAKEOVER);
        let lease_b = granted_lease(out);
        assert_eq!(lease_b.writer_id, b);
        assert_ne!(lease_b.lease_token, lease_a.lease_token);

        let stale_renew = rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Renew,
            after_expiry + 1,
            Some(&lease_a.lease_token),
            Some(&lease_b),
        ));
        assert_eq!(stale_renew.reason_code(), reason_codes::LEASE_HELD_BY_OTHER);
    }

    #[test]
    fn at_lease_03_renew_and_release_require_token() {
        let rt = LeaseRuntime::new(LeaseConfig::mvp_v1());
        let wid = window_id();
        let a = writer("writer_a");
        let lease = granted_lease(rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Claim,
            1_000_000,
            None,
            None,
        )));

        let wrong = rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Renew,
            2_000_000,
            Some("lease_bogus"),
            Some(&lease),
        ));
        assert_eq!(wrong.reason_code(), reason_codes::LEASE_TOKEN_INVALID);

        let renewed = granted_lease(rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Renew,
            2_000_000,
            Some(&lease.lease_token),
            Some(&lease),
        )));
        assert_eq!(renewed.lease_token, lease.lease_token);
        assert!(renewed.expires_at > lease.expires_at);

        let released = rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Release,
            3_000_000,
            Some(&lease.lease_token),
            Some(&renewed),
        ));
        assert_eq!(
            released,
            LeaseDecision::Granted {
                reason_code: reason_codes::LEASE_OK_RELEASED,
                lease: None,
                takeover: false,
            }
        );
    }

    #[test]
    fn at_lease_04_ttl_bounds_enforced() {
        let rt = LeaseRuntime::new(LeaseConfig::mvp_v1());
        let wid = window_id();
        let a = writer("writer_a");
        let mut req = request(&wid, &a, LeaseOperation::Claim, 1, None, None);
        req.requested_ttl_ms = 300_001;
        assert_eq!(
            rt.decide(&req).reason_code(),
            reason_codes::LEASE_TTL_OUT_OF_BOUNDS
        );
        req.requested_ttl_ms = 0;
        assert_eq!(
            rt.decide(&req).reason_code(),
            reason_codes::LEASE_TTL_OUT_OF_BOUNDS
        );
    }

    #[test]
    fn at_lease_05_renew_after_expiry_is_refused() {
        let rt = LeaseRuntime::new(LeaseConfig::mvp_v1());
        let wid = window_id();
        let a = writer("writer_a");
        let lease = granted_lease(rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Claim,
            1_000_000,
            None,
            None,
        )));
        let out = rt.decide(&request(
            &wid,
            &a,
            LeaseOperation::Renew,
            lease.expires_at.0,
            Some(&lease.lease_token),
            Some(&lease),
        ));
        assert_eq!(out.reason_code(), reason_codes::LEASE_EXPIRED);
    }
}
