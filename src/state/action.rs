//! What a step-sequence asks of its driver.

use core::ops::BitOr;

/// Readiness a suspended step-sequence waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Wait until the descriptor is readable
    R,
    /// Wait until the descriptor is writable
    W,
    /// Wait until the descriptor is readable or writable
    RW,
}

impl Wait {
    /// Whether the wait includes readability.
    pub fn wants_read(self) -> bool {
        matches!(self, Wait::R | Wait::RW)
    }

    /// Whether the wait includes writability.
    pub fn wants_write(self) -> bool {
        matches!(self, Wait::W | Wait::RW)
    }
}

/// Readiness observed by the driver and handed back on resume.
///
/// `Ready::NONE` is passed on the first resume and whenever a wait interval
/// elapsed without the descriptor becoming ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    /// Nothing observed
    pub const NONE: Ready = Ready(0);
    /// Readable
    pub const R: Ready = Ready(1);
    /// Writable
    pub const W: Ready = Ready(2);
    /// Readable and writable
    pub const RW: Ready = Ready(3);

    /// Whether readability was observed.
    pub fn is_readable(self) -> bool {
        self.0 & Self::R.0 != 0
    }

    /// Whether writability was observed.
    pub fn is_writable(self) -> bool {
        self.0 & Self::W.0 != 0
    }

    /// Whether the wait timed out.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Result of resuming a step-sequence.
#[derive(Debug)]
pub enum Step<T> {
    /// Suspend until the descriptor satisfies the wait
    Wait(Wait),
    /// The sequence completed with a value
    Done(T),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_bits() {
        assert!(Ready::NONE.is_none());
        assert!((Ready::R | Ready::W).is_writable());
        assert_eq!(Ready::R | Ready::W, Ready::RW);
        assert!(!Ready::W.is_readable());
    }

    #[test]
    fn test_wait_interest() {
        assert!(Wait::RW.wants_read() && Wait::RW.wants_write());
        assert!(!Wait::R.wants_write());
        assert!(!Wait::W.wants_read());
    }
}
