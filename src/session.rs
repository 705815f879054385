use std::{
  cell::UnsafeCell,
  ffi::CString,
  fmt::{self, Display, Formatter},
  fs,
  io,
  os::unix::io::AsRawFd,
  os::unix::net::UnixStream,
  process,
  time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
  sampler::Sampler,
  spinlock::SpinlockGuard,
  wire::{self, ClientConfiguration, Payload, Record},
};

/// Filesystem path of the central collector daemon's listening socket.
pub const DAEMON_SOCKET_PATH: &str = "/dev/socket/heapprof";

/// Daemon binary spawned for private sessions.
pub const DAEMON_BIN_PATH: &str = "/system/bin/heapprof";

/// System-wide property selecting the session mode; the value `fork` forces
/// a private daemon.
const MODE_PROPERTY: &str = "heapprof.mode";

/// Transmit and receive timeouts applied to the daemon socket.
const SOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sent in place of the command line when /proc is unreadable; the daemon
/// can still match a by-pid profiling request.
const UNKNOWN_CMDLINE: &str = "failed-to-read-cmdline";

/// waitpid flag for children cloned without an exit signal.
const WCLONE: libc::c_int = 0x8000_0000_u32 as libc::c_int;

/// Errors raised while establishing a session. All of them are benign for
/// the host: the caller logs and continues unprofiled.
#[derive(Debug)]
pub enum SessionError {
  Connect(io::Error),
  Handshake(io::Error),
  Spawn(io::Error),
}

impl Display for SessionError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Connect(err) => write!(f, "failed to connect to collector daemon: {err}"),
      Self::Handshake(err) => write!(f, "handshake with collector daemon failed: {err}"),
      Self::Spawn(err) => write!(f, "failed to spawn private collector daemon: {err}"),
    }
  }
}

impl std::error::Error for SessionError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Connect(err) | Self::Handshake(err) | Self::Spawn(err) => Some(err),
    }
  }
}

/// An established connection to the collector daemon.
///
/// A session is immutable once installed behind the process-wide pointer;
/// teardown replaces the pointer rather than mutating the session. The one
/// piece of interior state is the per-heap samplers, which are only touched
/// under the session spinlock (witnessed by the guard parameter of
/// `sample_size`).
#[derive(Debug)]
pub struct Session {
  config: ClientConfiguration,
  pid: u32,
  samplers: UnsafeCell<Vec<Sampler>>,
  sock: UnixStream,
}

// SAFETY: the samplers cell is reached only through `sample_size`, whose
// guard parameter proves the session spinlock is held.
unsafe impl Sync for Session {}

impl Session {
  /// Build a session according to the system-wide mode selection: `fork`
  /// skips the central daemon entirely; anything else tries central first
  /// and falls back to a private daemon.
  #[must_use]
  pub fn create() -> Option<Self> {
    if !force_fork_mode() {
      match Self::connect_central(DAEMON_SOCKET_PATH) {
        Ok(session) => return Some(session),
        Err(err) => info!("central daemon unavailable ({err}); benign on locked-down builds"),
      }
    }
    match Self::spawn_private(DAEMON_BIN_PATH) {
      Ok(session) => Some(session),
      Err(err) => {
        warn!("private daemon setup failed: {err}");
        None
      }
    }
  }

  #[must_use]
  pub fn client_config(&self) -> &ClientConfiguration {
    &self.config
  }

  /// Connect to the central daemon's well-known socket and handshake.
  ///
  /// # Errors
  /// `SessionError::Connect` when the socket is absent or refuses,
  /// `SessionError::Handshake` when the daemon misbehaves afterwards.
  pub fn connect_central(socket_path: &str) -> Result<Self, SessionError> {
    let sock = UnixStream::connect(socket_path).map_err(SessionError::Connect)?;
    Self::handshake(sock)
  }

  /// Send identity, receive the heap configuration, and build one sampler
  /// per configured heap.
  pub(crate) fn handshake(sock: UnixStream) -> Result<Self, SessionError> {
    sock
      .set_write_timeout(Some(SOCK_TIMEOUT))
      .map_err(SessionError::Handshake)?;
    sock
      .set_read_timeout(Some(SOCK_TIMEOUT))
      .map_err(SessionError::Handshake)?;

    let pid = process::id();
    let identity = Record::handshake(u64::from(pid), read_own_cmdline());
    let mut buf = [0u8; 1024];
    wire::write_record(&sock, &identity, &mut buf).map_err(SessionError::Handshake)?;

    let reply = wire::read_record(&sock).map_err(SessionError::Handshake)?;
    let config = match reply.payload {
      Some(Payload::ClientConfiguration(config)) => config,
      _ => {
        return Err(SessionError::Handshake(io::Error::new(
          io::ErrorKind::InvalidData,
          "expected a client configuration frame",
        )))
      }
    };

    let samplers = config
      .heaps
      .iter()
      .map(|heap| Sampler::new(heap.sampling_interval))
      .collect();

    info!(heaps = config.heaps.len(), "profiling session established");
    Ok(Self {
      config,
      pid,
      samplers: UnsafeCell::new(samplers),
      sock,
    })
  }

  /// Whether this session still belongs to the calling process. A session
  /// inherited across clone or vfork is stale and gets replaced on the next
  /// initialization.
  #[must_use]
  pub fn is_connected(&self) -> bool {
    self.pid == process::id()
  }

  /// Detects clone()/vfork() children that inherited the session without
  /// going through the fork handler. Treated as an implicit shutdown.
  fn is_post_fork(&self) -> bool {
    if self.pid == process::id() {
      return false;
    }
    debug!("session inherited across clone/vfork; treating as shut down");
    true
  }

  /// Emit a Free record. `false` means the record could not be delivered
  /// and the session should be torn down.
  #[must_use]
  pub fn record_free(&self, service_heap_id: u32, alloc_id: u64) -> bool {
    if self.is_post_fork() {
      return false;
    }
    let record = Record::free(service_heap_id, alloc_id);
    let mut buf = [0u8; wire::MAX_FRAME_SZ];
    match wire::write_record(&self.sock, &record, &mut buf) {
      Ok(()) => true,
      Err(err) => {
        warn!("failed to emit free record: {err}");
        false
      }
    }
  }

  /// Emit a Malloc record. `false` means the record could not be delivered
  /// and the session should be torn down.
  #[must_use]
  pub fn record_malloc(
    &self,
    service_heap_id: u32,
    alloc_id: u64,
    sampled_size: u64,
    raw_size: u64,
  ) -> bool {
    if self.is_post_fork() {
      return false;
    }
    let record = Record::malloc(service_heap_id, alloc_id, sampled_size, raw_size);
    let mut buf = [0u8; wire::MAX_FRAME_SZ];
    match wire::write_record(&self.sock, &record, &mut buf) {
      Ok(()) => true,
      Err(err) => {
        warn!("failed to emit malloc record: {err}");
        false
      }
    }
  }

  /// Bytes to attribute to an allocation on the given service-side heap, or
  /// 0 to skip it. The guard witnesses that sampler state is serialized.
  #[must_use]
  pub fn sample_size(&self, service_heap_id: u32, size: u64, _lock: &SpinlockGuard<'_>) -> u64 {
    // SAFETY: the guard proves the caller holds the session spinlock, the
    // only path to this cell.
    let samplers = unsafe { &mut *self.samplers.get() };
    match samplers.get_mut(service_heap_id as usize) {
      Some(sampler) => sampler.sample_size(size),
      None => 0,
    }
  }

  /// Create a socket pair, hand one end to a freshly spawned private daemon
  /// and handshake over the other.
  ///
  /// The daemon is detached with two clones rather than fork so that the
  /// host's pthread_atfork handlers never run and the host never sees a
  /// surprise SIGCHLD.
  ///
  /// # Errors
  /// `SessionError::Spawn` for any failure before the socket is live,
  /// `SessionError::Handshake` afterwards.
  pub fn spawn_private(daemon_path: &str) -> Result<Self, SessionError> {
    let (parent_sock, child_sock) = UnixStream::pair().map_err(SessionError::Spawn)?;
    retain_on_exec(child_sock.as_raw_fd()).map_err(SessionError::Spawn)?;

    let pid = process::id();
    let cmdline = read_own_cmdline();

    // argv is built before the clone: between clone and exec the child must
    // not allocate, since other host threads may hold allocator locks.
    let argv = PrivateDaemonArgs::new(daemon_path, pid, &cmdline, child_sock.as_raw_fd())
      .map_err(SessionError::Spawn)?;

    match clone_without_sigchld() {
      -1 => Err(SessionError::Spawn(io::Error::last_os_error())),
      0 => {
        // Child. Detaching clones again and terminates this process; the
        // remainder runs in a reparented grandchild. Only _exit leaves.
        if daemonize() == -1 {
          unsafe { libc::_exit(1) };
        }
        argv.exec();
        unsafe { libc::_exit(1) };
      }
      clone_pid => {
        drop(child_sock);
        reap_intermediate_child(clone_pid)?;
        Self::handshake(parent_sock)
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn pretend_forked(&mut self) {
    self.pid = self.pid.wrapping_add(1);
  }
}

/// NUL-separated argv handed to the private daemon. Everything is allocated
/// up front; `exec` itself only reads.
struct PrivateDaemonArgs {
  bin: CString,
  args: [CString; 3],
}

impl PrivateDaemonArgs {
  fn new(daemon_path: &str, pid: u32, cmdline: &str, fd: libc::c_int) -> io::Result<Self> {
    let nul = |err| io::Error::new(io::ErrorKind::InvalidInput, err);
    Ok(Self {
      bin: CString::new(daemon_path).map_err(nul)?,
      args: [
        CString::new(format!("--exclusive-for-pid={pid}")).map_err(nul)?,
        CString::new(format!("--exclusive-for-cmdline={cmdline}")).map_err(nul)?,
        CString::new(format!("--inherit-socket-fd={fd}")).map_err(nul)?,
      ],
    })
  }

  /// Returns only on failure.
  fn exec(&self) {
    let argv = [
      self.bin.as_ptr(),
      self.args[0].as_ptr(),
      self.args[1].as_ptr(),
      self.args[2].as_ptr(),
      std::ptr::null(),
    ];
    // SAFETY: argv is NUL-terminated and outlives the call.
    unsafe { libc::execv(self.bin.as_ptr(), argv.as_ptr()) };
  }
}

/// clone(2) with no exit signal. The raw syscall bypasses the libc fork
/// wrapper, so none of the host's pthread_atfork handlers run and the host
/// receives no SIGCHLD for this child.
fn clone_without_sigchld() -> libc::pid_t {
  unsafe {
    libc::syscall(
      libc::SYS_clone,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
    ) as libc::pid_t
  }
}

/// clone(2) that behaves like fork for wait purposes, still bypassing
/// atfork handlers. Used inside the already-detached child.
fn clone_with_sigchld() -> libc::pid_t {
  unsafe {
    libc::syscall(
      libc::SYS_clone,
      libc::SIGCHLD as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
      0 as libc::c_ulong,
    ) as libc::pid_t
  }
}

/// Like daemon(3), but clone-based. On success the calling process has been
/// replaced by a session-leader grandchild with stdio pointed at /dev/null.
fn daemonize() -> libc::c_int {
  match clone_with_sigchld() {
    -1 => return -1,
    0 => {}
    _ => unsafe { libc::_exit(0) },
  }
  if unsafe { libc::setsid() } == -1 {
    return -1;
  }
  unsafe {
    libc::chdir(b"/\0".as_ptr().cast());
    let fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
    if fd != -1 {
      libc::dup2(fd, libc::STDIN_FILENO);
      libc::dup2(fd, libc::STDOUT_FILENO);
      libc::dup2(fd, libc::STDERR_FILENO);
      if fd > libc::STDERR_FILENO {
        libc::close(fd);
      }
    }
  }
  0
}

/// Whether the system-wide mode property forces a private daemon.
fn force_fork_mode() -> bool {
  read_system_property(MODE_PROPERTY).as_deref() == Some("fork")
}

/// First NUL-terminated token of /proc/self/cmdline.
fn read_own_cmdline() -> String {
  match fs::read("/proc/self/cmdline") {
    Ok(bytes) => {
      let token = bytes.split(|byte| *byte == 0).next().unwrap_or(&[]);
      if token.is_empty() {
        UNKNOWN_CMDLINE.to_string()
      } else {
        String::from_utf8_lossy(token).into_owned()
      }
    }
    Err(err) => {
      warn!("failed to read own cmdline ({err}); by-pid profiling still works");
      UNKNOWN_CMDLINE.to_string()
    }
  }
}

#[cfg(target_os = "android")]
fn read_system_property(key: &str) -> Option<String> {
  // PROP_VALUE_MAX from the property ABI.
  const PROP_VALUE_MAX: usize = 92;

  let key = CString::new(key).ok()?;
  let mut value = [0 as libc::c_char; PROP_VALUE_MAX];
  // SAFETY: value is PROP_VALUE_MAX bytes as the property API requires.
  let len = unsafe { libc::__system_property_get(key.as_ptr(), value.as_mut_ptr()) };
  if len <= 0 {
    return None;
  }
  let bytes: Vec<u8> = value[..len as usize].iter().map(|&c| c as u8).collect();
  String::from_utf8(bytes).ok()
}

#[cfg(not(target_os = "android"))]
fn read_system_property(_key: &str) -> Option<String> {
  None
}

/// Reap the immediate clone child (the detach parent), tolerating hosts
/// that made their children unwaitable.
fn reap_intermediate_child(pid: libc::pid_t) -> Result<(), SessionError> {
  let mut status = 0;
  loop {
    let ret = unsafe { libc::waitpid(pid, &mut status, WCLONE) };
    if ret != -1 {
      return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
      Some(libc::EINTR) => continue,
      Some(libc::ECHILD) => return Ok(()),
      _ => return Err(SessionError::Spawn(err)),
    }
  }
}

/// Clear FD_CLOEXEC so the daemon inherits the socket across exec.
fn retain_on_exec(fd: libc::c_int) -> io::Result<()> {
  let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
  if flags == -1 {
    return Err(io::Error::last_os_error());
  }
  if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}
