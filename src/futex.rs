//! Cross-process futex wait/wake and a futex-backed mutex
//!
//! The futex word lives inside the shared segment, so waiters and wakers may
//! be different processes. `FUTEX_PRIVATE_FLAG` is deliberately not used.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Spins attempted before falling back to the kernel in `lock_word`
const LOCK_SPIN_LIMIT: u32 = 64;

/// Sleep until `*word != expected`, a wake arrives, or the timeout expires.
///
/// Spurious returns are allowed; callers must re-check their condition.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::ptr;

    // Avoid the syscall when the condition already changed
    if word.load(Ordering::Acquire) != expected {
        return;
    }

    let ts;
    let ts_ptr = match timeout {
        Some(d) => {
            ts = libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => ptr::null(),
    };

    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake one waiter sleeping on `word`
#[cfg(target_os = "linux")]
pub fn wake_one(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1i32,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake every waiter sleeping on `word`
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    // Fallback for non-Linux: bounded sleep, callers re-check their condition
    if word.load(Ordering::Acquire) != expected {
        return;
    }
    let nap = timeout
        .unwrap_or(Duration::from_millis(1))
        .min(Duration::from_millis(1));
    std::thread::sleep(nap);
}

#[cfg(not(target_os = "linux"))]
pub fn wake_one(_word: &AtomicU32) {}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}

/// Mutex states: 0 = unlocked, 1 = locked, 2 = locked with waiters
mod lock_state {
    pub const UNLOCKED: u32 = 0;
    pub const LOCKED: u32 = 1;
    pub const CONTENDED: u32 = 2;
}

/// Lock a shared-memory mutex word, returning a guard that unlocks on drop.
///
/// A process that dies while holding the lock leaves it held; segment
/// recreation is the recovery path.
pub fn lock_word(word: &AtomicU32) -> LockGuard<'_> {
    if word
        .compare_exchange(
            lock_state::UNLOCKED,
            lock_state::LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        )
        .is_ok()
    {
        return LockGuard(word);
    }

    // Brief spin before involving the kernel
    for _ in 0..LOCK_SPIN_LIMIT {
        core::hint::spin_loop();
        if word
            .compare_exchange(
                lock_state::UNLOCKED,
                lock_state::LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return LockGuard(word);
        }
    }

    loop {
        if word.swap(lock_state::CONTENDED, Ordering::Acquire) == lock_state::UNLOCKED {
            return LockGuard(word);
        }
        wait(word, lock_state::CONTENDED, None);
    }
}

/// RAII guard for a locked mutex word
pub struct LockGuard<'a>(&'a AtomicU32);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.0.swap(lock_state::UNLOCKED, Ordering::Release) == lock_state::CONTENDED {
            wake_one(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_lock_mutual_exclusion() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let word = Arc::clone(&word);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock_word(&word);
                    // Non-atomic read-modify-write under the lock
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wait_returns_on_wake() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0, Some(Duration::from_millis(100)));
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake_all(&word);
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        wait(&word, 0, Some(Duration::from_millis(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
