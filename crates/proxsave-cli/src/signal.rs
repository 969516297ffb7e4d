use std::sync::OnceLock;

use proxsave_core::cancel::CancelToken;

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// Install SIGINT/SIGTERM handlers that trip the returned token.
///
/// The first signal cancels cooperatively and restores the default
/// handler, so a second signal terminates immediately.
pub fn install_signal_handlers() -> CancelToken {
    let token = CANCEL.get_or_init(CancelToken::new).clone();

    #[cfg(unix)]
    {
        // Safety: the handler only clones an Arc'd flag and restores the
        // default disposition.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }

    token
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
    // Restore the default handler so a second signal kills immediately.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
