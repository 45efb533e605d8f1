//! Windows network-share connections through the WNet API.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use cnc_agent_protocol::Credentials;
use windows_sys::Win32::Foundation::NO_ERROR;
use windows_sys::Win32::NetworkManagement::WNet::{
    CONNECT_TEMPORARY, NETRESOURCEW, RESOURCETYPE_DISK, WNetAddConnection2W,
    WNetCancelConnection2W,
};

use crate::{AuthError, ShareConnector};

/// Opens a deviceless, temporary connection to the share with the request's
/// credentials and force-closes it afterwards.
pub struct WNetShareConnector;

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

fn describe(code: u32) -> String {
    std::io::Error::from_raw_os_error(code as i32).to_string()
}

impl ShareConnector for WNetShareConnector {
    fn connect(&self, share: &str, credentials: &Credentials) -> Result<(), AuthError> {
        let user = credentials.qualified_username();
        let mut remote = wide(share);
        let user_w = wide(&user);
        let password_w = wide(&credentials.password);

        // SAFETY: NETRESOURCEW is plain data; all-zero is a valid value and
        // every pointer stored in it outlives the call.
        let code = unsafe {
            let mut resource: NETRESOURCEW = std::mem::zeroed();
            resource.dwType = RESOURCETYPE_DISK;
            resource.lpRemoteName = remote.as_mut_ptr();
            WNetAddConnection2W(
                &resource,
                password_w.as_ptr(),
                user_w.as_ptr(),
                CONNECT_TEMPORARY,
            )
        };

        if code != NO_ERROR {
            return Err(AuthError::Connect {
                share: share.to_string(),
                user,
                message: describe(code),
            });
        }
        Ok(())
    }

    fn disconnect(&self, share: &str) -> Result<(), AuthError> {
        let name = wide(share);
        // SAFETY: `name` is a NUL-terminated UTF-16 string alive for the call.
        let code = unsafe { WNetCancelConnection2W(name.as_ptr(), 0, 1) };
        if code != NO_ERROR {
            return Err(AuthError::Disconnect {
                share: share.to_string(),
                message: describe(code),
            });
        }
        Ok(())
    }
}
