//! Host kernel version probe.
//!
//! The engine depends on three ring features that landed in Linux 5.19:
//! completion-skip-on-success, drop-free completions, and ring-mapped
//! buffer groups. Older kernels are rejected at startup rather than
//! failing obscurely on the first registration.

use std::ffi::CStr;
use std::io;

/// Minimum supported kernel.
pub const MIN_KERNEL: (u32, u32) = (5, 19);

/// Return the running kernel's (major, minor) version from `uname(2)`.
pub fn running_kernel() -> io::Result<(u32, u32)> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    parse_release(&release.to_string_lossy()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unparsable kernel release")
    })
}

/// Parse "major.minor" out of a release string such as `6.8.0-41-generic`.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor: &str = parts.next()?;
    // Strip trailing non-digits ("19+" and friends from custom builds).
    let digits = minor.trim_end_matches(|c: char| !c.is_ascii_digit());
    let minor = digits.parse().ok()?;
    Some((major, minor))
}
