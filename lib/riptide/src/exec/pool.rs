use crate::protocol::codec::Command;
use crate::reactor::registry::RegistryHandle;
use crate::ConnId;
use ballast::logging::{self, Logger};
use ballast::stop::StopToken;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// One unit of general-purpose work: a decoded command plus the
/// descriptor it arrived on.
pub struct PoolTask {
    pub cmd: Command,
    pub fd: ConnId,
}

struct PoolInner {
    run: bool,
    tasks: VecDeque<PoolTask>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    available: Condvar,
}

/// Fixed-size pool for command translation that must not run on the
/// reactor thread. Results re-enter the reactor as registry commands.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        registry: Arc<RegistryHandle>,
        stop: StopToken,
        log: &Logger,
    ) -> WorkerPool {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                run: true,
                tasks: VecDeque::new(),
            }),
            available: Condvar::new(),
        });

        {
            let shared = shared.clone();
            stop.on_stop(move || shared.available.notify_all());
        }

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = shared.clone();
            let registry = registry.clone();
            let stop = stop.clone();
            let log = log.new(logging::o!("component" => "worker-pool", "worker" => index));
            workers.push(std::thread::spawn(move || {
                worker_loop(&shared, &registry, &stop, &log)
            }));
        }

        WorkerPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Classifier for commands this pool should run. Reserved: every
    /// variant currently routes elsewhere.
    pub fn is_pool_command(_cmd: &Command) -> bool {
        false
    }

    /// Queues a task unless the pool has been stopped.
    pub fn enqueue(&self, cmd: Command, fd: ConnId) -> bool {
        {
            let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
            if !inner.run {
                return false;
            }
            inner.tasks.push_back(PoolTask { cmd, fd });
        }
        self.shared.available.notify_one();
        true
    }

    /// Stops intake, wakes every worker, and joins them. Tasks already
    /// queued are drained; running tasks finish uninterrupted.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.inner.lock().expect("pool lock poisoned");
            inner.run = false;
        }
        self.shared.available.notify_all();

        let mut workers = self.workers.lock().expect("pool worker list poisoned");
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &PoolShared, registry: &RegistryHandle, stop: &StopToken, log: &Logger) {
    loop {
        let task = {
            let mut inner = shared.inner.lock().expect("pool lock poisoned");
            loop {
                if let Some(task) = inner.tasks.pop_front() {
                    break task;
                }
                if !inner.run || stop.is_stop_requested() {
                    return;
                }
                inner = shared.available.wait(inner).expect("pool lock poisoned");
            }
        };

        execute(registry, task, log);
    }
}

fn execute(registry: &RegistryHandle, task: PoolTask, _log: &Logger) {
    match task.cmd {
        Command::Say { text, .. } => registry.request_broadcast(task.fd, Command::response(text)),
        Command::Nick { nick } => registry.request_change_nickname(task.fd, nick),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tls::TlsContext;
    use crate::reactor::registry::{Registry, RegistryCommand};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn test_registry() -> Registry {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../certs");
        let tls =
            TlsContext::new_server(&dir.join("server.crt.pem"), &dir.join("server.key.pem")).unwrap();
        Registry::new(tls, &ballast::logging::discard()).unwrap()
    }

    fn drain_until(handle: &RegistryHandle, count: usize) -> Vec<RegistryCommand> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < count {
            assert!(Instant::now() < deadline, "expected {} commands, got {}", count, out.len());
            out.extend(handle.take_pending());
            std::thread::yield_now();
        }
        out
    }

    #[test]
    fn test_no_command_is_pool_bound() {
        assert!(!WorkerPool::is_pool_command(&Command::ListRoom));
        assert!(!WorkerPool::is_pool_command(&Command::response("x")));
        assert!(!WorkerPool::is_pool_command(&Command::Nick { nick: "n".into() }));
    }

    #[test]
    fn test_tasks_from_one_submitter_run_in_order() {
        let registry = test_registry();
        let handle = registry.handle();
        let stop = ballast::stop::StopSource::new();
        let pool = WorkerPool::new(1, handle.clone(), stop.token(), &ballast::logging::discard());

        for i in 0..4 {
            assert!(pool.enqueue(
                Command::Say {
                    room_id: "1".into(),
                    text: format!("m{}", i),
                },
                9,
            ));
        }

        let commands = drain_until(&handle, 4);
        for (i, cmd) in commands.iter().enumerate() {
            match cmd {
                RegistryCommand::Broadcast(fd, Command::Response { text }) => {
                    assert_eq!(*fd, 9);
                    assert_eq!(text, &format!("m{}", i));
                }
                _ => panic!("unexpected command at {}", i),
            }
        }

        pool.stop();
    }

    #[test]
    fn test_enqueue_rejected_after_stop() {
        let registry = test_registry();
        let stop = ballast::stop::StopSource::new();
        let pool = WorkerPool::new(2, registry.handle(), stop.token(), &ballast::logging::discard());

        pool.stop();
        assert!(!pool.enqueue(Command::Nick { nick: "late".into() }, 1));
    }
}
