//! Thin macro shim over the `log` crate.
//!
//! With the `log` feature enabled the macros forward to `::log::*!`;
//! with it disabled they expand to `format_args!`, which still
//! type-checks the call site (so call sites never need `#[cfg]`) but
//! produces no code.

#[cfg(feature = "log")]
#[allow(unused)]
mod details {
    macro_rules! trace {
        ($($args:tt)*) => {{
            ::log::trace!($($args)*);
        }};
    }

    macro_rules! debug {
        ($($args:tt)*) => {{
            ::log::debug!($($args)*);
        }};
    }

    macro_rules! info {
        ($($args:tt)*) => {{
            ::log::info!($($args)*);
        }};
    }

    macro_rules! warn_ {
        ($($args:tt)*) => {{
            ::log::warn!($($args)*);
        }};
    }

    macro_rules! error {
        ($($args:tt)*) => {{
            ::log::error!($($args)*);
        }};
    }

    pub(crate) use {debug, error, info, trace};
    pub(crate) use warn_ as warn;
}

#[cfg(not(feature = "log"))]
#[allow(unused)]
mod details {
    macro_rules! trace {
        (target: $target:expr, $($args:tt)*) => {{
            let _ = $target;
            format_args!($($args)*);
        }};
        ($($args:tt)*) => {{
            format_args!($($args)*);
        }};
    }

    macro_rules! debug {
        (target: $target:expr, $($args:tt)*) => {{
            let _ = $target;
            format_args!($($args)*);
        }};
        ($($args:tt)*) => {{
            format_args!($($args)*);
        }};
    }

    macro_rules! info {
        (target: $target:expr, $($args:tt)*) => {{
            let _ = $target;
            format_args!($($args)*);
        }};
        ($($args:tt)*) => {{
            format_args!($($args)*);
        }};
    }

    macro_rules! warn_ {
        (target: $target:expr, $($args:tt)*) => {{
            let _ = $target;
            format_args!($($args)*);
        }};
        ($($args:tt)*) => {{
            format_args!($($args)*);
        }};
    }

    macro_rules! error {
        (target: $target:expr, $($args:tt)*) => {{
            let _ = $target;
            format_args!($($args)*);
        }};
        ($($args:tt)*) => {{
            format_args!($($args)*);
        }};
    }

    pub(crate) use {debug, error, info, trace};
    pub(crate) use warn_ as warn;
}

pub(crate) use details::{debug, error, info, trace, warn};
