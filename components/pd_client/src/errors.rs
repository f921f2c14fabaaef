// Copyright 2016 TiKV Project Authors. Licensed under Apache-2.0.

use std::error;
use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load the cluster id from any PD endpoint")]
    FailToInitClusterId,
    #[error("the PD client is closing")]
    Closing,
    #[error("the request is canceled by the caller")]
    Canceled,
    #[error("the PD leader is unknown")]
    NoLeader,
    #[error("tso response carries {got} timestamps for a batch of {expect}")]
    TsoBatchLength { expect: u32, got: u32 },
    #[error("tso stream failed: {0}")]
    TsoStream(String),
    #[error("store {0} is missing in the response")]
    StoreNotFound(u64),
    #[error("PD server reported an error: {0}")]
    PdServer(String),
    #[error("gRPC error: {0}")]
    Grpc(#[from] grpcio::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown error {0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;

/// Builds an `Error::Other` from a message or a format string.
#[macro_export]
macro_rules! box_err {
    ($e:expr) => ({
        let e: Box<dyn std::error::Error + Sync + Send> =
            format!("[{}:{}]: {}", file!(), line!(), $e).into();
        $crate::Error::Other(e)
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::box_err!(format!($f, $($arg),+))
    });
}
