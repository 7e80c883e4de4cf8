//! Exception handling in the dynamic loader.
//!
//! Any loader operation that can fail reports the failure through
//! [`signal_error`] or [`signal_exception`]. If a catch frame is installed
//! (by [`catch_exception`]), the resulting [`Throw`] propagates to the
//! innermost frame by ordinary early return; if no frame is installed, the
//! signal is fatal and terminates the process with a one-line diagnostic on
//! standard error.
//!
//! Catch frames are per-thread. Very early in bootstrap, before thread-local
//! storage can be trusted, a single global slot is used instead; the one-way
//! transition to per-thread slots happens at [`switch_to_thread_frames`].
//! That window is safe only because it is single-threaded.

use std::borrow::Cow;
use std::cell::Cell;
use std::ffi::CStr;
use std::fmt;
use std::ptr::NonNull;

use miette::Diagnostic;
use tracing::debug;

use crate::debug::{debug_mask, DebugFlags};
use crate::error::CaughtError;

/// Used in the fatal diagnostic when the signal site did not name an
/// occasion.
const DEFAULT_OCCASION: &str = "error while loading shared libraries";

/// One failure to load or relocate an object.
///
/// The message is either a borrowed static literal or an owned buffer; the
/// distinction is observable through [`Exception::is_owned_message`] and
/// mirrors whether the diagnostic had to be duplicated at the signal site.
#[derive(Debug, Clone, Diagnostic)]
pub struct Exception {
    /// The shared object involved. Empty for the main program.
    pub object_name: String,
    message: Cow<'static, str>,
}

impl Exception {
    pub fn new(object_name: impl Into<String>, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            object_name: object_name.into(),
            message: message.into(),
        }
    }

    /// The human-readable diagnostic text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the message was duplicated into owned storage at the signal
    /// site, rather than referring to a static literal.
    pub fn is_owned_message(&self) -> bool {
        matches!(self.message, Cow::Owned(_))
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.object_name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.object_name, self.message)
        }
    }
}

impl std::error::Error for Exception {}

/// An in-flight signaled error, on its way to the innermost catch frame.
///
/// Only the `signal_*` functions construct these; they propagate through
/// [`OpResult`] returns and are consumed by [`catch_exception`].
#[derive(Debug)]
#[must_use = "a Throw must propagate to the enclosing catch_exception"]
pub struct Throw {
    pub(crate) code: i32,
    pub(crate) exception: Exception,
}

impl Throw {
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn exception(&self) -> &Exception {
        &self.exception
    }
}

/// The result type of operations running under a catch frame.
pub type OpResult<T> = Result<T, Throw>;

/// Per-thread (or, during bootstrap, global) catch frame bookkeeping.
///
/// Frames form a strictly nested stack; only a depth and a suppression flag
/// need to be tracked, because the control transfer itself is ordinary early
/// return and always lands in the matching [`catch_exception`] invocation.
mod frames {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug, Default)]
    pub(super) struct CatchState {
        /// Number of installed catch frames.
        pub frames: usize,
        /// True inside `no_catch`/`receive_errors`: enclosing frames are
        /// hidden and a plain signal is fatal.
        pub suppressed: bool,
    }

    static THREADED: AtomicBool = AtomicBool::new(false);

    // Bootstrap slot. Exactly one thread exists while this is in use.
    static BOOT_FRAMES: AtomicUsize = AtomicUsize::new(0);
    static BOOT_SUPPRESSED: AtomicBool = AtomicBool::new(false);

    thread_local! {
        static STATE: Cell<CatchState> = const {
            Cell::new(CatchState {
                frames: 0,
                suppressed: false,
            })
        };
    }

    pub(super) fn activate_threaded() {
        THREADED.store(true, Ordering::Release);
    }

    /// The one place that selects between the bootstrap slot and the
    /// per-thread slot.
    fn threaded() -> bool {
        THREADED.load(Ordering::Acquire)
    }

    pub(super) fn get() -> CatchState {
        if threaded() {
            STATE.with(|s| s.get())
        } else {
            CatchState {
                frames: BOOT_FRAMES.load(Ordering::Relaxed),
                suppressed: BOOT_SUPPRESSED.load(Ordering::Relaxed),
            }
        }
    }

    pub(super) fn set(state: CatchState) {
        if threaded() {
            STATE.with(|s| s.set(state));
        } else {
            BOOT_FRAMES.store(state.frames, Ordering::Relaxed);
            BOOT_SUPPRESSED.store(state.suppressed, Ordering::Relaxed);
        }
    }

    pub(super) fn replace(state: CatchState) -> CatchState {
        let old = get();
        set(state);
        old
    }

    pub(super) fn catch_active() -> bool {
        let state = get();
        state.frames > 0 && !state.suppressed
    }

    /// Installs one catch frame; restores the previous state on drop, on
    /// both the normal and the propagating path.
    pub(super) struct FrameGuard {
        prev: CatchState,
    }

    impl FrameGuard {
        pub(super) fn push() -> Self {
            let prev = get();
            set(CatchState {
                frames: prev.frames + 1,
                // A new frame re-enables catching even inside a suppressed
                // scope, exactly like installing a fresh catch over a null
                // one.
                suppressed: false,
            });
            Self { prev }
        }
    }

    impl Drop for FrameGuard {
        fn drop(&mut self) {
            set(self.prev);
        }
    }

    /// Hides all enclosing frames; restores on drop.
    pub(super) struct SuppressGuard {
        prev: CatchState,
    }

    impl SuppressGuard {
        pub(super) fn engage() -> Self {
            let prev = get();
            set(CatchState {
                frames: prev.frames,
                suppressed: true,
            });
            Self { prev }
        }
    }

    impl Drop for SuppressGuard {
        fn drop(&mut self) {
            set(self.prev);
        }
    }
}

/// Switch catch-frame storage from the bootstrap global slot to per-thread
/// slots. One-way; must be called exactly once, while the process is still
/// single-threaded (typically right after thread-local storage is set up).
pub fn switch_to_thread_frames() {
    frames::activate_threaded();
}

fn strerror(code: i32) -> String {
    let ptr = unsafe { libc::strerror(code) };
    if ptr.is_null() {
        format!("Unknown error {code}")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

/// Lossage with no catch frame installed is always fatal.
fn fatal_error(code: i32, object_name: &str, occasion: Option<&str>, message: &str) -> ! {
    let progname = std::env::args().next().unwrap_or_default();
    let mut line = format!(
        "{}: {}: ",
        progname,
        occasion.unwrap_or(DEFAULT_OCCASION)
    );
    if !object_name.is_empty() {
        line.push_str(object_name);
        line.push_str(": ");
    }
    line.push_str(message);
    if code != 0 {
        line.push_str(": ");
        line.push_str(&strerror(code));
    }
    line.push('\n');
    eprint!("{line}");
    std::process::exit(127);
}

/// Report a failure at the signal site. Returns the [`Throw`] to propagate
/// to the innermost catch frame, or terminates the process if no frame is
/// installed.
///
/// `occasion` is used only in the fatal diagnostic; it is never stored in
/// the exception.
pub fn signal_error(
    code: i32,
    object_name: &str,
    occasion: Option<&str>,
    message: impl Into<Cow<'static, str>>,
) -> Throw {
    let message = message.into();
    if frames::catch_active() {
        Throw {
            code,
            exception: Exception::new(object_name, message),
        }
    } else {
        fatal_error(code, object_name, occasion, &message)
    }
}

/// Like [`signal_error`], but relays an already-captured exception.
pub fn signal_exception(code: i32, exception: Exception, occasion: Option<&str>) -> Throw {
    if frames::catch_active() {
        Throw { code, exception }
    } else {
        fatal_error(code, &exception.object_name, occasion, &exception.message)
    }
}

type Receiver = dyn FnMut(i32, &str, &str);

thread_local! {
    static RECEIVER: Cell<Option<NonNull<Receiver>>> = const { Cell::new(None) };
}

fn call_receiver(code: i32, object_name: &str, message: &str) -> bool {
    let Some(ptr) = RECEIVER.with(|r| r.take()) else {
        return false;
    };
    // The receiver stays installed across the call; the slot is emptied for
    // its duration so the handler cannot recursively deliver to itself.
    unsafe { (*ptr.as_ptr())(code, object_name, message) };
    RECEIVER.with(|r| r.set(Some(ptr)));
    true
}

fn trace_continuable(object_name: &str, occasion: Option<&str>, message: &str, continued: bool) {
    if debug_mask().intersects(DebugFlags::all().difference(DebugFlags::STATISTICS)) {
        debug!(
            "{}: error: {}: {} ({})",
            object_name,
            occasion.unwrap_or(DEFAULT_OCCASION),
            message,
            if continued { "continued" } else { "fatal" }
        );
    }
}

/// Continuable variant of [`signal_error`]. If an error receiver is
/// installed, it is invoked and `None` is returned: the failed operation is
/// expected to continue with a sentinel value. Otherwise this escalates to
/// the non-continuable path.
pub fn signal_cerror(
    code: i32,
    object_name: &str,
    occasion: Option<&str>,
    message: impl Into<Cow<'static, str>>,
) -> Option<Throw> {
    let message = message.into();
    trace_continuable(
        object_name,
        occasion,
        &message,
        RECEIVER.with(|r| r.get()).is_some(),
    );
    if call_receiver(code, object_name, &message) {
        None
    } else {
        Some(signal_error(code, object_name, occasion, message))
    }
}

/// Continuable variant of [`signal_exception`]. On continuation the
/// exception is consumed.
pub fn signal_cexception(code: i32, exception: Exception, occasion: Option<&str>) -> Option<Throw> {
    trace_continuable(
        &exception.object_name,
        occasion,
        &exception.message,
        RECEIVER.with(|r| r.get()).is_some(),
    );
    if call_receiver(code, &exception.object_name, &exception.message) {
        None
    } else {
        Some(signal_exception(code, exception, occasion))
    }
}

/// Install a catch frame, run `op`, and report a signaled error as a value.
///
/// On success the frame is simply removed. A [`Throw`] propagating out of
/// `op` necessarily targets this frame (inner frames have already consumed
/// their own throws) and is returned as a [`CaughtError`]; the caller now
/// owns the exception record.
pub fn catch_exception<T>(op: impl FnOnce() -> OpResult<T>) -> Result<T, CaughtError> {
    let guard = frames::FrameGuard::push();
    let result = op();
    drop(guard);
    match result {
        Ok(value) => Ok(value),
        Err(Throw { code, exception }) => Err(CaughtError { code, exception }),
    }
}

/// Run `op` with catching disabled: enclosing catch frames are hidden, so
/// any error signaled within is necessarily fatal. Used when entering
/// contexts where partial failure cannot be meaningfully recovered.
pub fn no_catch<T>(op: impl FnOnce() -> OpResult<T>) -> T {
    let guard = frames::SuppressGuard::engage();
    let result = op();
    drop(guard);
    match result {
        Ok(value) => value,
        // A throw cannot cross this boundary: any signal raised while
        // catching was suppressed already terminated the process, and inner
        // frames consume their own throws.
        Err(throw) => fatal_error(
            throw.code,
            &throw.exception.object_name,
            None,
            &throw.exception.message,
        ),
    }
}

/// Run `op` with `handler` installed as the continuable error receiver and
/// catch frames suppressed. While active, `signal_cerror`/`signal_cexception`
/// deliver to `handler` instead of unwinding. The previous receiver and
/// frame state are restored on exit, including on panic.
pub fn receive_errors<R>(handler: &mut dyn FnMut(i32, &str, &str), op: impl FnOnce() -> R) -> R {
    // Erase the handler's lifetime for storage in the thread-local slot.
    // Sound because the guard below removes it again before `handler`'s
    // borrow ends, on every exit path.
    let ptr = unsafe {
        std::mem::transmute::<NonNull<dyn FnMut(i32, &str, &str) + '_>, NonNull<Receiver>>(
            NonNull::from(handler),
        )
    };

    let suppress = frames::SuppressGuard::engage();
    let prev_recv = RECEIVER.with(|r| r.replace(Some(ptr)));

    struct RecvGuard {
        prev: Option<NonNull<Receiver>>,
    }
    impl Drop for RecvGuard {
        fn drop(&mut self) {
            RECEIVER.with(|r| r.set(self.prev));
        }
    }
    let recv_guard = RecvGuard { prev: prev_recv };

    let ret = op();

    drop(recv_guard);
    drop(suppress);
    ret
}
