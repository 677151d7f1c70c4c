//! Scheduling hint for audio threads

/// Ask the OS to favour the calling thread. Best effort.
pub fn promote_current_thread(name: &str) {
    #[cfg(windows)]
    {
        use windows::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
        };
        // SAFETY: GetCurrentThread returns a pseudo handle valid for the
        // calling thread; SetThreadPriority has no other preconditions.
        let _ = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) };
        tracing::debug!("{}: requested time-critical priority", name);
    }
    #[cfg(not(windows))]
    {
        tracing::debug!("{}: no real-time priority on this platform", name);
    }
}
