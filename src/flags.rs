/*
 * flags.rs
 *
 * One mask for both directions: READ/WRITE/EDGE_TRIGGER/BLOCKING go in with
 * a registration, READ/WRITE/EOF/ERROR come back out with a delivery.
 */

use bitflags::bitflags;

bitflags! {
    /// Request and delivery bits for fd watchers.
    ///
    /// `READ`/`WRITE` select interest; `EDGE_TRIGGER` asks the kernel for
    /// edge semantics; `BLOCKING` skips the automatic O_NONBLOCK switch.
    /// Delivered events reuse `READ`/`WRITE` and add `EOF`/`ERROR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const READ         = 1 << 0;
        const WRITE        = 1 << 1;
        const EDGE_TRIGGER = 1 << 2;
        const BLOCKING     = 1 << 3;
        const EOF          = 1 << 4;
        const ERROR        = 1 << 5;
    }
}

impl EventFlags {
    /* bits a delivery may carry; the fold stack accumulates exactly these */
    pub(crate) const EVENT_MASK: Self =
        Self::READ.union(Self::WRITE).union(Self::EOF).union(Self::ERROR);

    /// True when the mask expresses any I/O interest.
    #[inline]
    #[must_use]
    pub fn wants_io(self) -> bool {
        self.intersects(Self::READ.union(Self::WRITE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_io() {
        assert!(EventFlags::READ.wants_io());
        assert!(EventFlags::WRITE.wants_io());
        assert!((EventFlags::READ | EventFlags::EDGE_TRIGGER).wants_io());
        assert!(!EventFlags::EDGE_TRIGGER.wants_io());
        assert!(!EventFlags::empty().wants_io());
    }

    #[test]
    fn test_event_mask_excludes_request_only_bits() {
        assert!(!EventFlags::EVENT_MASK.contains(EventFlags::EDGE_TRIGGER));
        assert!(!EventFlags::EVENT_MASK.contains(EventFlags::BLOCKING));
        assert!(EventFlags::EVENT_MASK.contains(EventFlags::EOF));
        assert!(EventFlags::EVENT_MASK.contains(EventFlags::ERROR));
    }
}
