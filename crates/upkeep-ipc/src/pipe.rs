//! Byte-stream endpoints: Unix domain sockets, or named pipes on Windows.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::channel::Endpoint;

/// Why a client could not open the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectFailure {
    /// Nothing listens under the name: the server is starting, between instances or gone.
    NoInstance,
    /// Every instance is connected to another client.
    Busy,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectRetry {
    /// Block until the server offers an instance, up to the given time.
    WaitForInstance(Duration),
    Sleep(Duration),
    GiveUp,
}

const CONNECT_BUSY_ATTEMPTS: u32 = 20;
const CONNECT_MISSING_ATTEMPTS: u32 = 5;
const CONNECT_INSTANCE_WAIT: Duration = Duration::from_millis(100);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// What a client does after its `attempt`-th failed open (counting from zero).
///
/// A missing instance only gets a short grace period: it is either the server's brief gap
/// between instances or a server that is not running at all.
pub(crate) fn connect_retry(failure: ConnectFailure, attempt: u32) -> ConnectRetry {
    match failure {
        ConnectFailure::Busy if attempt < CONNECT_BUSY_ATTEMPTS => {
            ConnectRetry::WaitForInstance(CONNECT_INSTANCE_WAIT)
        }
        ConnectFailure::NoInstance if attempt < CONNECT_MISSING_ATTEMPTS => {
            ConnectRetry::Sleep(CONNECT_RETRY_DELAY)
        }
        _ => ConnectRetry::GiveUp,
    }
}

#[cfg(unix)]
mod imp {
    use std::fs;
    use std::io::{self, Read, Write};
    use std::net::Shutdown;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::PathBuf;
    use std::thread;

    use super::{connect_retry, ConnectFailure, ConnectRetry};
    use crate::channel::Endpoint;

    pub struct Listener {
        inner: UnixListener,
        address: PathBuf,
    }

    impl Listener {
        pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
            let address = endpoint.address().to_path_buf();
            if let Some(parent) = address.parent() {
                fs::create_dir_all(parent)?;
            }
            let _ = fs::remove_file(&address);
            Ok(Self {
                inner: UnixListener::bind(&address)?,
                address,
            })
        }

        pub fn accept(&self) -> io::Result<Stream> {
            let (stream, _) = self.inner.accept()?;
            Ok(Stream(stream))
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.address);
        }
    }

    pub struct Stream(UnixStream);

    impl Stream {
        pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
            let mut attempt = 0;
            loop {
                let err = match UnixStream::connect(endpoint.address()) {
                    Ok(stream) => return Ok(Self(stream)),
                    Err(err) => err,
                };
                let failure = match err.kind() {
                    io::ErrorKind::NotFound => ConnectFailure::NoInstance,
                    // A full accept backlog.
                    io::ErrorKind::WouldBlock => ConnectFailure::Busy,
                    _ => ConnectFailure::Other,
                };
                match connect_retry(failure, attempt) {
                    ConnectRetry::WaitForInstance(delay) | ConnectRetry::Sleep(delay) => {
                        thread::sleep(delay)
                    }
                    ConnectRetry::GiveUp => return Err(err),
                }
                attempt += 1;
            }
        }

        pub fn try_clone(&self) -> io::Result<Self> {
            self.0.try_clone().map(Self)
        }

        pub fn shutdown(&self) {
            let _ = self.0.shutdown(Shutdown::Both);
        }
    }

    impl Read for Stream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Stream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.flush()
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
    use std::os::windows::prelude::OsStrExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{
        ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING, ERROR_NO_DATA,
        ERROR_OPERATION_ABORTED, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, ERROR_PIPE_NOT_CONNECTED,
        HANDLE, WIN32_ERROR,
    };
    use windows::Win32::Storage::FileSystem::{
        ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_DUPLEX,
    };
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, WaitNamedPipeW,
        PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
    };
    use windows::Win32::System::Threading::CreateEventW;
    use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

    use super::{connect_retry, ConnectFailure, ConnectRetry};
    use crate::channel::Endpoint;

    const PIPE_BUFFER: u32 = 64 * 1024;

    fn wide_name(endpoint: &Endpoint) -> Vec<u16> {
        endpoint
            .address()
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    fn is_os_error(err: &io::Error, code: WIN32_ERROR) -> bool {
        err.raw_os_error() == Some(code.0 as i32)
    }

    // Win32 failures arrive as FACILITY_WIN32 HRESULTs.
    fn os_error(err: windows::core::Error) -> io::Error {
        let code = err.code().0 as u32;
        if code & 0xFFFF_0000 == 0x8007_0000 {
            io::Error::from_raw_os_error((code & 0xFFFF) as i32)
        } else {
            io::Error::other(err)
        }
    }

    /// Runs one overlapped operation on `handle` and waits for it to finish.
    ///
    /// `closed` is checked once the operation is queued; a stream shut down in between cancels
    /// it here, since the shutdown's own cancel may have run first.
    fn overlapped_io(
        handle: HANDLE,
        closed: Option<&AtomicBool>,
        start: impl FnOnce(*mut OVERLAPPED) -> windows::core::Result<()>,
    ) -> io::Result<u32> {
        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(os_error)?;
        let event = unsafe { OwnedHandle::from_raw_handle(event.0) };
        let mut overlapped = OVERLAPPED {
            hEvent: HANDLE(event.as_raw_handle()),
            ..OVERLAPPED::default()
        };
        if let Err(err) = start(&mut overlapped as *mut OVERLAPPED) {
            let err = os_error(err);
            if !is_os_error(&err, ERROR_IO_PENDING) {
                return Err(err);
            }
            if closed.is_some_and(|closed| closed.load(Ordering::SeqCst)) {
                let _ = unsafe { CancelIoEx(handle, Some(&overlapped as *const OVERLAPPED)) };
            }
        }
        let mut transferred = 0u32;
        // The wait keeps `overlapped` alive until the kernel is done with it.
        unsafe { GetOverlappedResult(handle, &overlapped, &mut transferred, true) }
            .map_err(os_error)?;
        Ok(transferred)
    }

    fn create_instance(name: &[u16]) -> io::Result<File> {
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR::from_raw(name.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER,
                PIPE_BUFFER,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_handle(handle.0) })
    }

    /// Always keeps one instance listening so clients never find the name missing while an
    /// accepted instance is handed out.
    pub struct Listener {
        name: Vec<u16>,
        next: Mutex<Option<File>>,
    }

    impl Listener {
        pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
            let name = wide_name(endpoint);
            let first = create_instance(&name)?;
            Ok(Self {
                name,
                next: Mutex::new(Some(first)),
            })
        }

        /// Blocks until a client connects to the listening instance.
        pub fn accept(&self) -> io::Result<Stream> {
            let pending = self
                .next
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let file = match pending {
                Some(file) => file,
                None => create_instance(&self.name)?,
            };
            let handle = HANDLE(file.as_raw_handle());
            if let Err(err) = overlapped_io(handle, None, |overlapped| unsafe {
                ConnectNamedPipe(handle, Some(overlapped))
            }) {
                // The client connected between creation and the wait.
                if !is_os_error(&err, ERROR_PIPE_CONNECTED) {
                    return Err(err);
                }
            }
            // A failed replacement is retried by the next accept.
            *self.next.lock().unwrap_or_else(PoisonError::into_inner) =
                create_instance(&self.name).ok();
            Ok(Stream::new(file, true))
        }
    }

    struct Shared {
        file: File,
        server_side: bool,
        closed: AtomicBool,
    }

    impl Shared {
        fn handle(&self) -> HANDLE {
            HANDLE(self.file.as_raw_handle())
        }
    }

    /// Clones share one overlapped handle, so a blocked read never holds up a write.
    pub struct Stream(Arc<Shared>);

    impl Stream {
        fn new(file: File, server_side: bool) -> Self {
            Self(Arc::new(Shared {
                file,
                server_side,
                closed: AtomicBool::new(false),
            }))
        }

        pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
            let name = wide_name(endpoint);
            let mut attempt = 0;
            loop {
                let opened = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(FILE_FLAG_OVERLAPPED.0)
                    .open(endpoint.address());
                let err = match opened {
                    Ok(file) => return Ok(Self::new(file, false)),
                    Err(err) => err,
                };
                let failure = if is_os_error(&err, ERROR_PIPE_BUSY) {
                    ConnectFailure::Busy
                } else if is_os_error(&err, ERROR_FILE_NOT_FOUND) {
                    ConnectFailure::NoInstance
                } else {
                    ConnectFailure::Other
                };
                match connect_retry(failure, attempt) {
                    ConnectRetry::WaitForInstance(timeout) => {
                        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
                        let _ = unsafe { WaitNamedPipeW(PCWSTR::from_raw(name.as_ptr()), millis) };
                    }
                    ConnectRetry::Sleep(delay) => thread::sleep(delay),
                    ConnectRetry::GiveUp => return Err(err),
                }
                attempt += 1;
            }
        }

        pub fn try_clone(&self) -> io::Result<Self> {
            Ok(Self(Arc::clone(&self.0)))
        }

        pub fn shutdown(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
            let handle = self.0.handle();
            let _ = unsafe { CancelIoEx(handle, None) };
            if self.0.server_side {
                let _ = unsafe { DisconnectNamedPipe(handle) };
            }
        }
    }

    impl Read for Stream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.closed.load(Ordering::SeqCst) || buf.is_empty() {
                return Ok(0);
            }
            let len = buf.len().min(u32::MAX as usize);
            let handle = self.0.handle();
            let read = overlapped_io(handle, Some(&self.0.closed), |overlapped| unsafe {
                ReadFile(handle, Some(&mut buf[..len]), None, Some(overlapped))
            });
            match read {
                Ok(read) => Ok(read as usize),
                Err(err)
                    if [
                        ERROR_BROKEN_PIPE,
                        ERROR_OPERATION_ABORTED,
                        ERROR_PIPE_NOT_CONNECTED,
                        ERROR_NO_DATA,
                    ]
                    .iter()
                    .any(|code| is_os_error(&err, *code)) =>
                {
                    Ok(0)
                }
                Err(err) => Err(err),
            }
        }
    }

    impl Write for Stream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.0.closed.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let len = buf.len().min(u32::MAX as usize);
            let handle = self.0.handle();
            let written = overlapped_io(handle, Some(&self.0.closed), |overlapped| unsafe {
                WriteFile(handle, Some(&buf[..len]), None, Some(overlapped))
            })?;
            Ok(written as usize)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

/// Accepts connections on one channel.
pub struct PipeListener(imp::Listener);

impl PipeListener {
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        imp::Listener::bind(endpoint).map(Self)
    }

    pub fn accept(&self) -> io::Result<PipeStream> {
        self.0.accept().map(PipeStream)
    }
}

/// One connected duplex byte stream.
pub struct PipeStream(imp::Stream);

impl PipeStream {
    pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        imp::Stream::connect(endpoint).map(Self)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        self.0.try_clone().map(Self)
    }

    /// Unblocks readers on every clone of this stream.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
