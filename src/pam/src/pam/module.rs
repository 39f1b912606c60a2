/*
   MIT License

   Copyright (c) 2015 TOZNY
   Copyright (c) 2020 William Brown <william@blackhats.net.au>
   Copyright (c) 2025 David Mulder <dmulder@samba.org>

   Permission is hereby granted, free of charge, to any person obtaining a copy
   of this software and associated documentation files (the "Software"), to deal
   in the Software without restriction, including without limitation the rights
   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
   copies of the Software, and to permit persons to whom the Software is
   furnished to do so, subject to the following conditions:

   The above copyright notice and this permission notice shall be included in all
   copies or substantial portions of the Software.

   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
   SOFTWARE.
*/
use std::ffi::{CStr, CString};

use libc::{c_char, c_void};

use crate::pam::constants::*;
use crate::pam::conv::PamConv;

/// Opaque type, used as a pointer when making pam API calls.
#[repr(C)]
pub struct PamHandle {
    _data: [u8; 0],
}

#[link(name = "pam")]
extern "C" {
    fn pam_get_user(
        pamh: *const PamHandle,
        user: &mut *const c_char,
        prompt: *const c_char,
    ) -> PamResultCode;

    fn pam_get_item(
        pamh: *const PamHandle,
        item_type: PamItemType,
        item: &mut *const c_void,
    ) -> PamResultCode;

    fn pam_set_item(
        pamh: *const PamHandle,
        item_type: PamItemType,
        item: *const c_void,
    ) -> PamResultCode;
}

pub type PamResult<T> = Result<T, PamResultCode>;

impl PamHandle {
    /// Retrieves the name of the user who is authenticating or logging in,
    /// asking the application to prompt for it if necessary.
    pub fn get_user(&self, prompt: Option<&str>) -> PamResult<String> {
        let prompt_cstr = match prompt {
            Some(p) => Some(CString::new(p).map_err(|_| PamResultCode::PAM_CONV_ERR)?),
            None => None,
        };
        let prompt_ptr = prompt_cstr
            .as_ref()
            .map(|p| p.as_ptr())
            .unwrap_or(std::ptr::null());

        let mut raw: *const c_char = std::ptr::null();
        let res = unsafe { pam_get_user(self, &mut raw, prompt_ptr) };
        if !matches!(res, PamResultCode::PAM_SUCCESS) {
            return Err(res);
        }
        if raw.is_null() {
            return Err(PamResultCode::PAM_USER_UNKNOWN);
        }
        Ok(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
    }

    /// Retrieves the application's conversation function.
    pub fn get_conv(&self) -> PamResult<PamConv> {
        let mut raw: *const c_void = std::ptr::null();
        let res = unsafe { pam_get_item(self, PAM_CONV, &mut raw) };
        if !matches!(res, PamResultCode::PAM_SUCCESS) {
            return Err(res);
        }
        if raw.is_null() {
            return Err(PamResultCode::PAM_CONV_ERR);
        }
        Ok(unsafe { &*(raw as *const PamConv) }.clone())
    }

    /// Switches the session to the given local user name.
    pub fn set_user(&self, user: &str) -> PamResult<()> {
        let user_cstr = CString::new(user).map_err(|_| PamResultCode::PAM_BAD_ITEM)?;
        let res = unsafe { pam_set_item(self, PAM_USER, user_cstr.as_ptr() as *const c_void) };
        if matches!(res, PamResultCode::PAM_SUCCESS) {
            Ok(())
        } else {
            Err(res)
        }
    }
}

/// The module's entry points; default to ignoring the call.
pub trait PamHooks {
    fn sm_authenticate(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }

    fn sm_setcred(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }

    fn acct_mgmt(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }

    fn sm_open_session(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }

    fn sm_close_session(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }

    fn sm_chauthtok(_pamh: &PamHandle, _args: Vec<&CStr>, _flags: PamFlag) -> PamResultCode {
        PamResultCode::PAM_IGNORE
    }
}
