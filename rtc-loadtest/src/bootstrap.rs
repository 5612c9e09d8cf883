//! Process bootstrap.

use log::{debug, warn};

/// File descriptors a large run needs: sockets per participant plus timers.
pub const TARGET_FD_LIMIT: u64 = 65535;

/// Raises the open file limit towards [`TARGET_FD_LIMIT`]. Limits already at
/// or above it are left alone. Failure is logged and the run continues with
/// the current limit.
#[cfg(unix)]
pub fn raise_fd_limit() {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    let (soft, hard) = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok(limits) => limits,
        Err(err) => {
            warn!("could not read open file limit: {err}");
            return;
        }
    };
    let Some((want_soft, want_hard)) = wanted_limits(soft, hard) else {
        debug!("open file limit {soft} is enough");
        return;
    };

    match setrlimit(Resource::RLIMIT_NOFILE, want_soft, want_hard) {
        Ok(()) => debug!("open file limit raised from {soft} to {want_soft}"),
        Err(err) => match fallback_soft_limit(soft, hard) {
            // without privileges only the soft limit may be raised, up to the hard limit
            Some(fallback) => match setrlimit(Resource::RLIMIT_NOFILE, fallback, hard) {
                Ok(()) => warn!(
                    "could not raise open file limit to {want_soft} ({err}), using {fallback}"
                ),
                Err(err) => warn!("could not raise open file limit: {err}"),
            },
            None => warn!("could not raise open file limit above {soft}: {err}"),
        },
    }
}

#[cfg(not(unix))]
pub fn raise_fd_limit() {
    debug!("open file limit is left unchanged on this platform");
}

/// `(soft, hard)` to request, `None` when the soft limit is already enough.
/// The hard limit is never lowered.
#[cfg_attr(not(unix), allow(dead_code))]
fn wanted_limits(soft: u64, hard: u64) -> Option<(u64, u64)> {
    (soft < TARGET_FD_LIMIT).then(|| (TARGET_FD_LIMIT, hard.max(TARGET_FD_LIMIT)))
}

/// Highest soft limit reachable without touching `hard`, if it is a raise.
#[cfg_attr(not(unix), allow(dead_code))]
fn fallback_soft_limit(soft: u64, hard: u64) -> Option<u64> {
    let fallback = hard.min(TARGET_FD_LIMIT);
    (fallback > soft).then_some(fallback)
}
