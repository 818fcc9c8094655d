/// Core for local worker `thread_index`, assigning downward from `start_core`.
///
/// Returns `None` when the worker would land below core 0.
pub fn core_for_thread(start_core: usize, thread_index: usize) -> Option<usize> {
    start_core.checked_sub(thread_index)
}

fn num_online_cores() -> usize {
    unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) as usize }
}

/// Explicit start core, or the highest online core.
pub fn start_core(affinity_start: Option<usize>) -> usize {
    affinity_start.unwrap_or_else(|| num_online_cores().saturating_sub(1))
}

fn pin_to_core(core_id: usize) -> Result<(), i32> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret == 0 {
            Ok(())
        } else {
            Err(*libc::__errno_location())
        }
    }
}

/// Pin the calling worker thread. Failure is logged, not fatal.
pub fn pin_current_thread(slot: u64, core_id: usize) {
    match pin_to_core(core_id) {
        Ok(()) => tracing::debug!(slot, core_id, "pinned"),
        Err(errno) => tracing::warn!(slot, core_id, errno, "failed to pin worker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cores_assigned_downward() {
        assert_eq!(core_for_thread(7, 0), Some(7));
        assert_eq!(core_for_thread(7, 3), Some(4));
        assert_eq!(core_for_thread(7, 7), Some(0));
        assert_eq!(core_for_thread(7, 8), None);
    }

    #[test]
    fn test_start_core_defaults_to_highest_online_core() {
        assert!(num_online_cores() >= 1);
        assert_eq!(start_core(Some(3)), 3);
        assert_eq!(start_core(None), num_online_cores() - 1);
    }
}
