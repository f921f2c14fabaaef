// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use kvproto::pdpb::*;

use super::*;

/// Answers the first `failures` TSO batches with a wrong timestamp count,
/// then behaves like a healthy allocator.
#[derive(Debug, Default)]
pub struct FlakyTso {
    failures: AtomicUsize,
    logical: AtomicI64,
}

impl FlakyTso {
    pub fn new(failures: usize) -> FlakyTso {
        FlakyTso {
            failures: AtomicUsize::new(failures),
            logical: AtomicI64::new(0),
        }
    }
}

impl PdMocker for FlakyTso {
    fn tso(&self, req: &TsoRequest) -> Option<Result<TsoResponse>> {
        let count = req.get_count();
        let broken = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let logical = self.logical.fetch_add(count as i64, Ordering::SeqCst) + count as i64;
        let mut resp = TsoResponse::default();
        resp.set_header(Service::header());
        resp.set_count(if broken { count + 1 } else { count });
        resp.mut_timestamp().set_physical(1);
        resp.mut_timestamp().set_logical(logical);
        Some(Ok(resp))
    }
}

/// Accepts TSO batches and never answers them.
#[derive(Debug, Default)]
pub struct TsoHang;

impl TsoHang {
    pub fn new() -> TsoHang {
        TsoHang
    }
}

impl PdMocker for TsoHang {
    fn tso(&self, _: &TsoRequest) -> Option<Result<TsoResponse>> {
        None
    }
}
