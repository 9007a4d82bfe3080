// Copyright 2021 The Silofs Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the silofs storage engine: errno-style error
//! constructors, logger bootstrap and the compression layer.

pub mod compress;

use std::io;

/// Initialize the process-wide logger. `spec` follows the usual
/// module-filter syntax, e.g. "info" or "silofs_storage=debug"; the
/// `RUST_LOG` environment variable takes precedence.
pub fn setup_logging(spec: &str) -> io::Result<()> {
    flexi_logger::Logger::with_env_or_str(spec)
        .start()
        .map(|_| ())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("logger: {}", e)))
}

/// Fetch the last OS error, optionally logging a message first.
#[macro_export]
macro_rules! last_error {
    () => {
        std::io::Error::last_os_error()
    };
    ($msg:expr) => {{
        log::error!("{}: {}", $msg, std::io::Error::last_os_error());
        std::io::Error::last_os_error()
    }};
}

#[macro_export]
macro_rules! einval {
    () => {
        std::io::Error::from(std::io::ErrorKind::InvalidInput)
    };
    ($msg:expr) => {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", $msg))
    };
}

#[macro_export]
macro_rules! enoent {
    () => {
        std::io::Error::from(std::io::ErrorKind::NotFound)
    };
    ($msg:expr) => {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{}", $msg))
    };
}

#[macro_export]
macro_rules! eio {
    () => {
        std::io::Error::new(std::io::ErrorKind::Other, "I/O error")
    };
    ($msg:expr) => {
        std::io::Error::new(std::io::ErrorKind::Other, format!("{}", $msg))
    };
}

#[macro_export]
macro_rules! enosys {
    () => {
        std::io::Error::from(std::io::ErrorKind::Unsupported)
    };
    ($msg:expr) => {
        std::io::Error::new(std::io::ErrorKind::Unsupported, format!("{}", $msg))
    };
}

#[macro_export]
macro_rules! etimedout {
    () => {
        std::io::Error::from(std::io::ErrorKind::TimedOut)
    };
    ($msg:expr) => {
        std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{}", $msg))
    };
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use crate::{einval, enoent, eio, etimedout};

    #[test]
    fn test_error_macros() {
        assert_eq!(einval!().kind(), ErrorKind::InvalidInput);
        assert_eq!(enoent!("no such block").kind(), ErrorKind::NotFound);
        assert_eq!(etimedout!("timeout after 60s").kind(), ErrorKind::TimedOut);
        let e = eio!(format!("upload {}: {}", "k", "boom"));
        assert!(e.to_string().contains("upload k"));
    }
}
