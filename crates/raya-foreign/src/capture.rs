//! Post-call platform error state
//!
//! A downcall may ask for platform error values to be recorded immediately
//! after the native callee returns, before anything else can clobber them.
//! The values are written as consecutive `i32`s in the ABI's fixed order,
//! skipping states the mask does not select.

use std::fmt;

use crate::error::programming_error;

/// A platform error value that can be captured after a downcall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturableState {
    GetLastError,
    WsaGetLastError,
    Errno,
}

impl CapturableState {
    pub const ALL: [CapturableState; 3] = [
        CapturableState::GetLastError,
        CapturableState::WsaGetLastError,
        CapturableState::Errno,
    ];

    /// Bit of this state in a `CaptureMask`
    pub fn mask(self) -> u32 {
        match self {
            CapturableState::GetLastError => 1 << 0,
            CapturableState::WsaGetLastError => 1 << 1,
            CapturableState::Errno => 1 << 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CapturableState::GetLastError => "GetLastError",
            CapturableState::WsaGetLastError => "WSAGetLastError",
            CapturableState::Errno => "errno",
        }
    }

    /// Read the current value of this state on the calling thread
    pub fn read(self) -> i32 {
        match self {
            CapturableState::Errno => read_errno(),
            CapturableState::GetLastError => read_last_error(),
            CapturableState::WsaGetLastError => read_wsa_last_error(),
        }
    }
}

impl fmt::Display for CapturableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of states to capture after a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CaptureMask(u32);

impl CaptureMask {
    pub const NONE: CaptureMask = CaptureMask(0);

    pub fn of(states: &[CapturableState]) -> Self {
        Self(states.iter().fold(0, |acc, s| acc | s.mask()))
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, state: CapturableState) -> bool {
        self.0 & state.mask() != 0
    }

    /// Selected states, in `order`
    pub fn states_in(self, order: &[CapturableState]) -> impl Iterator<Item = CapturableState> + '_ {
        order.iter().copied().filter(move |s| self.contains(*s))
    }

    /// Bits not belonging to any known state
    pub fn unknown_bits(self) -> u32 {
        let known = CapturableState::ALL.iter().fold(0, |acc, s| acc | s.mask());
        self.0 & !known
    }
}

/// Capture the selected states into `out`, in `order`.
///
/// Returns the number of values written. `out` must hold one `i32` per
/// selected state.
pub fn capture_call_state(order: &[CapturableState], mask: CaptureMask, out: &mut [i32]) -> usize {
    let selected = mask.states_in(order).count();
    if out.len() < selected {
        programming_error(format!(
            "capture buffer holds {} values but {} states are selected",
            out.len(),
            selected
        ));
    }
    for (slot, state) in out.iter_mut().zip(mask.states_in(order)) {
        *slot = state.read();
    }
    selected
}

#[cfg(unix)]
fn read_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(windows)]
fn read_errno() -> i32 {
    extern "C" {
        fn _errno() -> *mut std::ffi::c_int;
    }
    unsafe { *_errno() }
}

#[cfg(not(any(unix, windows)))]
fn read_errno() -> i32 {
    0
}

#[cfg(windows)]
fn read_last_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(not(windows))]
fn read_last_error() -> i32 {
    0
}

#[cfg(windows)]
fn read_wsa_last_error() -> i32 {
    unsafe { windows_sys::Win32::Networking::WinSock::WSAGetLastError() }
}

#[cfg(not(windows))]
fn read_wsa_last_error() -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_contains() {
        let mask = CaptureMask::of(&[CapturableState::Errno]);
        assert!(mask.contains(CapturableState::Errno));
        assert!(!mask.contains(CapturableState::GetLastError));
        assert_eq!(mask.unknown_bits(), 0);
        assert_eq!(CaptureMask::from_bits(1 << 7).unknown_bits(), 1 << 7);
    }

    #[test]
    fn test_states_follow_order() {
        let mask = CaptureMask::of(&[CapturableState::Errno, CapturableState::GetLastError]);
        let states: Vec<_> = mask.states_in(&CapturableState::ALL).collect();
        assert_eq!(states, vec![CapturableState::GetLastError, CapturableState::Errno]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_capture_errno_after_failed_call() {
        let rc = unsafe { libc::close(-1) };
        let mut out = [0i32; 1];
        let written = capture_call_state(
            &[CapturableState::Errno],
            CaptureMask::of(&[CapturableState::Errno]),
            &mut out,
        );
        assert_eq!(rc, -1);
        assert_eq!(written, 1);
        assert_eq!(out[0], libc::EBADF);
    }

    #[test]
    #[should_panic(expected = "capture buffer holds 1 values but 2 states are selected")]
    fn test_short_capture_buffer_is_fatal() {
        let mask = CaptureMask::of(&[CapturableState::Errno, CapturableState::GetLastError]);
        let mut out = [0i32; 1];
        capture_call_state(&CapturableState::ALL, mask, &mut out);
    }
}
