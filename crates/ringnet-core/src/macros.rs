/// Checks an invariant that should never fail in a correct caller.
///
/// Panics in debug builds, the way `assert()` did in the original; in
/// release builds it logs via `tracing::error!` and lets the caller carry on
/// rather than taking the whole node down over a single bad peer.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($($arg)+);
            } else {
                tracing::error!($($arg)+);
            }
        }
    };
}

/// Logs-and-continues a condition that should be unreachable in practice.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)+) => {
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        } else {
            tracing::error!($($arg)+);
        }
    };
}
