//! 进程权限查询（挂载前的环境检查，仅供参考，不影响挂载流程）。

pub trait PrivilegeChecker: Send + Sync {
    fn has_elevated_privileges(&self) -> bool;
}

/// 查询当前进程的真实权限：Windows 看令牌是否已提升，Unix 看 euid 是否为 0
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPrivilegeChecker;

impl PrivilegeChecker for OsPrivilegeChecker {
    #[cfg(unix)]
    fn has_elevated_privileges(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(windows)]
    fn has_elevated_privileges(&self) -> bool {
        token_is_elevated().unwrap_or_else(|e| {
            tracing::warn!("查询进程令牌失败: {}", e);
            false
        })
    }

    #[cfg(not(any(unix, windows)))]
    fn has_elevated_privileges(&self) -> bool {
        false
    }
}

#[cfg(windows)]
fn token_is_elevated() -> std::io::Result<bool> {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    let mut token: HANDLE = 0;
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut returned: u32 = 0;
    let ok = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    let result = if ok == 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(elevation.TokenIsElevated != 0)
    };
    unsafe { CloseHandle(token) };
    result
}

/// 固定返回值，测试用
#[derive(Debug, Clone, Copy)]
pub struct FixedPrivilege(pub bool);

impl PrivilegeChecker for FixedPrivilege {
    fn has_elevated_privileges(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_privilege() {
        assert!(FixedPrivilege(true).has_elevated_privileges());
        assert!(!FixedPrivilege(false).has_elevated_privileges());
    }

    #[cfg(unix)]
    #[test]
    fn test_os_checker_matches_euid() {
        let expected = unsafe { libc::geteuid() } == 0;
        assert_eq!(OsPrivilegeChecker.has_elevated_privileges(), expected);
    }
}
