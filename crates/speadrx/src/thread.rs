//! Worker thread helpers
//!
//! Long-running DAQ threads (ingress workers, reassemblers, persisters) are
//! plain OS threads that request elevated FIFO scheduling and, where asked,
//! a fixed CPU. Both requests are best-effort: a host that denies them gets
//! a warning and default scheduling, never a failure.

use std::thread::JoinHandle;

use log::warn;

/// Builder for a named DAQ worker thread
#[derive(Clone, Debug, Default)]
pub struct WorkerThread {
    name: String,
    cpu: Option<usize>,
    realtime: bool,
}

impl WorkerThread {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu: None,
            realtime: false,
        }
    }

    /// Pin the thread to one CPU
    pub fn pin_to(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Request FIFO scheduling at maximum priority
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Spawn the thread
    ///
    /// Panics only if the OS refuses to create a thread at all, which is
    /// fatal for the process anyway.
    pub fn spawn<F>(self, body: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Self {
            name,
            cpu,
            realtime,
        } = self;
        let thread_name = name.clone();

        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(cpu) = cpu {
                    set_current_affinity(&thread_name, cpu);
                }
                if realtime {
                    request_fifo_scheduling(&thread_name);
                }
                body()
            })
            .expect("failed to spawn worker thread")
    }
}

#[cfg(target_os = "linux")]
fn set_current_affinity(name: &str, cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        if libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        ) != 0
        {
            warn!("{name}: cannot set thread affinity to CPU {cpu}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_current_affinity(name: &str, cpu: usize) {
    warn!("{name}: thread affinity not supported on this platform (cpu {cpu})");
}

#[cfg(target_os = "linux")]
fn request_fifo_scheduling(name: &str) {
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param {
            sched_priority: priority,
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
            warn!("{name}: FIFO scheduling denied, continuing with default policy");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn request_fifo_scheduling(name: &str) {
    warn!("{name}: FIFO scheduling not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_runs_body() {
        let handle = WorkerThread::new("test-worker").pin_to(0).spawn(|| {});
        handle.join().unwrap();
    }
}
