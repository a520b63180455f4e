//! Process-wide redirection of the stdout and stderr file descriptors.
//!
//! The first registration swaps fds 1 and 2 for pipes drained by reader
//! threads; the last one puts the original descriptors back. Each captured
//! line goes to the most recently registered interceptor.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;

use super::{ConsoleInterceptor, ConsoleSource};

struct Sink {
    id: u64,
    interceptor: ConsoleInterceptor,
}

struct Redirected {
    target: RawFd,
    saved: OwnedFd,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    sinks: Vec<Sink>,
    streams: Vec<Redirected>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Held while descriptors are swapped; reader threads never take it.
static SWITCH: Mutex<()> = Mutex::new(());

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Keeps the process streams redirected to an interceptor until dropped.
pub(crate) struct Registration {
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        release(self.id);
    }
}

/// Route process output to `interceptor`, redirecting the descriptors if
/// nobody else has.
pub(crate) fn acquire(interceptor: ConsoleInterceptor) -> io::Result<Registration> {
    let _switch = SWITCH.lock().unwrap_or_else(|e| e.into_inner());
    let mut registry = registry();
    if registry.streams.is_empty() {
        let mut streams = Vec::with_capacity(2);
        for source in [ConsoleSource::Stdout, ConsoleSource::Stderr] {
            match redirect(source) {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    drop(registry);
                    for stream in streams {
                        restore(stream);
                    }
                    return Err(e);
                }
            }
        }
        registry.streams = streams;
    }
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    registry.sinks.push(Sink { id, interceptor });
    Ok(Registration { id })
}

fn release(id: u64) {
    let _switch = SWITCH.lock().unwrap_or_else(|e| e.into_inner());
    let streams = {
        let mut registry = registry();
        let last = registry.sinks.len() == 1 && registry.sinks[0].id == id;
        if last {
            std::mem::take(&mut registry.streams)
        } else {
            Vec::new()
        }
    };
    // Readers drain the pipes to EOF while the sink is still registered.
    for stream in streams {
        restore(stream);
    }
    registry().sinks.retain(|s| s.id != id);
}

fn target_fd(source: ConsoleSource) -> RawFd {
    match source {
        ConsoleSource::Stdout => libc::STDOUT_FILENO,
        ConsoleSource::Stderr => libc::STDERR_FILENO,
    }
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: dup has no memory-safety preconditions; the result is checked.
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `copy` is a freshly opened descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(copy) })
}

fn redirect(source: ConsoleSource) -> io::Result<Redirected> {
    let target = target_fd(source);
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors pipe writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created by pipe and are owned here.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let saved = dup(target)?;
    let passthrough = File::from(dup(target)?);

    flush_std();
    // SAFETY: both descriptors are open for the duration of the call.
    if unsafe { libc::dup2(write.as_raw_fd(), target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    drop(write);

    let reader = std::thread::Builder::new()
        .name(format!("console-{}", source.as_str()))
        .spawn(move || drain(File::from(read), passthrough, source));
    match reader {
        Ok(reader) => Ok(Redirected {
            target,
            saved,
            reader,
        }),
        Err(e) => {
            // SAFETY: as above.
            unsafe { libc::dup2(saved.as_raw_fd(), target) };
            Err(e)
        }
    }
}

fn restore(stream: Redirected) {
    flush_std();
    // SAFETY: `saved` is open until dropped below.
    if unsafe { libc::dup2(stream.saved.as_raw_fd(), stream.target) } < 0 {
        tracing::warn!(
            fd = stream.target,
            error = %io::Error::last_os_error(),
            "Failed to restore console descriptor"
        );
        return;
    }
    drop(stream.saved);
    if stream.reader.join().is_err() {
        tracing::warn!(fd = stream.target, "Console reader panicked");
    }
}

fn drain(read: File, mut passthrough: File, source: ConsoleSource) {
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                route(source, &line, &mut passthrough);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn route(source: ConsoleSource, bytes: &[u8], passthrough: &mut File) {
    let text = String::from_utf8_lossy(bytes);
    let interceptor = registry().sinks.last().map(|s| s.interceptor.clone());
    let captured = interceptor.is_some_and(|i| i.capture_line(source, &text));
    if !captured {
        let _ = writeln!(passthrough, "{text}");
    }
}

/// A handle on the process's stdout that keeps writing to the terminal while
/// fd 1 is redirected.
pub(crate) fn detached_stdout() -> io::Result<File> {
    Ok(File::from(dup(libc::STDOUT_FILENO)?))
}
