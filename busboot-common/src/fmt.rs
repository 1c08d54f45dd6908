// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Logging shim over the optional `defmt` and `log` backends.
//!
//! Format strings must stay within the subset both backends accept
//! (`{}`, `{:?}`, `{:#x}`).

macro_rules! upd_log {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "defmt")]
        defmt::$level!($($arg)+);
        #[cfg(feature = "log")]
        log::$level!($($arg)+);
        #[cfg(not(any(feature = "defmt", feature = "log")))]
        let _ = core::format_args!($($arg)+);
    }};
}
