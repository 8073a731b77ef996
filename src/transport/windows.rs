use std::ffi::c_void;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use windows_sys::Win32::Foundation::{LocalFree, ERROR_ACCESS_DENIED, ERROR_PIPE_BUSY};
use windows_sys::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows_sys::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

use super::Connection;

/// Generic-all access for Authenticated Users
const PIPE_SDDL: &str = "D:P(A;;GA;;;AU)";

const SERVER_PIPE: &str = r"\\.\pipe\wock";

pub(super) struct Listener {
    next: NamedPipeServer,
    path: PathBuf,
}

impl Listener {
    pub(super) async fn accept(&mut self) -> io::Result<Connection> {
        self.next.connect().await?;
        let next = create_pipe(&self.path, false)?;
        let connected = std::mem::replace(&mut self.next, next);
        Ok(Box::new(connected))
    }
}

pub(super) fn listen(path: &Path, exclusive: bool) -> io::Result<Listener> {
    let next = create_pipe(path, exclusive).map_err(|e| {
        if exclusive && e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
            io::Error::from(io::ErrorKind::AddrInUse)
        } else {
            e
        }
    })?;
    Ok(Listener {
        next,
        path: path.to_path_buf(),
    })
}

fn create_pipe(path: &Path, first_instance: bool) -> io::Result<NamedPipeServer> {
    let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(Some(0)).collect();
    let mut descriptor: PSECURITY_DESCRIPTOR = std::ptr::null_mut();

    // SAFETY: `sddl` is NUL-terminated and outlives the call
    let converted = unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            sddl.as_ptr(),
            SDDL_REVISION_1,
            &mut descriptor,
            std::ptr::null_mut(),
        )
    };
    if converted == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor,
        bInheritHandle: 0,
    };

    // SAFETY: `attributes` and the descriptor it points to stay alive until
    // the pipe has been created
    let server = unsafe {
        ServerOptions::new()
            .first_pipe_instance(first_instance)
            .create_with_security_attributes_raw(
                path,
                &mut attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
            )
    };

    // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW
    unsafe {
        LocalFree(descriptor);
    }

    server
}

pub(super) async fn connect(path: &Path) -> io::Result<Connection> {
    let client = ClientOptions::new().open(path)?;
    Ok(Box::new(client))
}

pub(super) fn is_retryable(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound || error.raw_os_error() == Some(ERROR_PIPE_BUSY as i32)
}

/// Access is granted through the pipe's security descriptor at creation
pub(super) fn grant_local_users(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Named pipes vanish with their last handle
pub(super) fn remove(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub(super) fn default_server_address() -> PathBuf {
    PathBuf::from(SERVER_PIPE)
}
