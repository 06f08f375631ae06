use std::io;

/// A scheduling priority hint for worker threads.
///
/// Each worker applies the hint to its own thread when it starts. On Linux the
/// hint adjusts the thread's nice value relative to the one it inherited;
/// elsewhere only [`Priority::Normal`] is supported. If the OS refuses the
/// change (raising priority usually needs privileges) the worker logs a
/// warning and keeps running at its inherited priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Run only when nothing else wants the CPU.
    Lowest,

    /// Yield to normal threads.
    BelowNormal,

    /// Keep the priority inherited from the thread that built the pool.
    Normal,

    /// Prefer workers over normal threads.
    AboveNormal,

    /// Prefer workers over everything else the OS allows.
    Highest,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Change in nice value; lower is more favourable.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn nice_offset(self) -> i32 {
        match self {
            Priority::Lowest => 10,
            Priority::BelowNormal => 5,
            Priority::Normal => 0,
            Priority::AboveNormal => -5,
            Priority::Highest => -10,
        }
    }
}

/// Apply a priority hint to the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn apply_to_current_thread(priority: Priority) -> io::Result<()> {
    let offset = priority.nice_offset();

    if offset == 0 {
        return Ok(());
    }

    let nice = (current_nice()? + offset).clamp(-20, 19);

    // With `who == 0`, PRIO_PROCESS addresses the calling thread on Linux.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn current_nice() -> io::Result<i32> {
    // -1 is a valid nice value, so errno is the only way to detect failure.
    unsafe {
        *libc::__errno_location() = 0;
    }

    let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };

    if nice == -1 {
        let error = io::Error::last_os_error();

        if error.raw_os_error() != Some(0) {
            return Err(error);
        }
    }

    Ok(nice)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn apply_to_current_thread(priority: Priority) -> io::Result<()> {
    if priority == Priority::Normal {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "thread priorities are not supported on this platform",
        ))
    }
}
