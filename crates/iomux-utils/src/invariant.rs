/// Checks a runtime bookkeeping invariant (ring byte totals, pool refcount
/// balance, destination-queue pairing).
///
/// Debug builds panic so the broken invariant is caught at its source. A
/// release runtime logs through `tracing` and keeps serving its other
/// binds instead — one damaged connection must not take the whole loop
/// down. Contract violations by callers (double release, send on a closed
/// bind) are not invariants and always abort; use `assert!`/`panic!` for
/// those.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($($arg)+);
            } else {
                tracing::error!(invariant = stringify!($cond), $($arg)+);
            }
        }
    };
}
