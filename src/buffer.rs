//! per-tick coalescing of streamed text fragments.
//!
//! fragments arriving between two ticks are concatenated in arrival order and
//! committed once. the tick itself is behind `TickScheduler`; in a bevy app
//! it is one frame (see `FrameFlushQueue`).

use bevy::prelude::*;

/// schedule-once / cancel access to the host's tick.
pub trait TickScheduler {
    /// request one flush at the next tick.
    fn schedule_once(&mut self);
    /// withdraw the outstanding request, if any.
    fn cancel(&mut self);
}

/// pending text plus the "flush already scheduled" flag. the flag is set iff
/// exactly one commit is outstanding.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pending: String,
    scheduled: bool,
}

impl StreamBuffer {
    pub fn append(&mut self, text: &str, scheduler: &mut impl TickScheduler) {
        if text.is_empty() {
            return;
        }
        self.pending.push_str(text);
        if !self.scheduled {
            scheduler.schedule_once();
            self.scheduled = true;
        }
    }

    /// the commit half of a flush. idempotent: an empty buffer only clears
    /// the flag and yields nothing.
    pub fn take_pending(&mut self) -> Option<String> {
        self.scheduled = false;
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// drop pending text without committing it.
    pub fn discard(&mut self, scheduler: &mut impl TickScheduler) {
        self.pending.clear();
        if self.scheduled {
            scheduler.cancel();
            self.scheduled = false;
        }
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}

/// sessions whose buffers flush on the next frame, in request order.
#[derive(Resource, Debug, Default)]
pub struct FrameFlushQueue {
    sessions: Vec<Entity>,
}

impl FrameFlushQueue {
    pub fn scheduler_for(&mut self, session: Entity) -> SessionTick<'_> {
        SessionTick { queue: self, session }
    }

    pub fn is_scheduled(&self, session: Entity) -> bool {
        self.sessions.contains(&session)
    }

    pub fn take(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.sessions)
    }
}

/// `TickScheduler` for one session entity backed by the frame queue.
pub struct SessionTick<'a> {
    queue: &'a mut FrameFlushQueue,
    session: Entity,
}

impl TickScheduler for SessionTick<'_> {
    fn schedule_once(&mut self) {
        if !self.queue.sessions.contains(&self.session) {
            self.queue.sessions.push(self.session);
        }
    }

    fn cancel(&mut self) {
        self.queue.sessions.retain(|e| *e != self.session);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::TickScheduler;

    #[derive(Debug, Default)]
    pub struct CountingTick {
        pub scheduled: usize,
        pub cancelled: usize,
    }

    impl TickScheduler for CountingTick {
        fn schedule_once(&mut self) {
            self.scheduled += 1;
        }

        fn cancel(&mut self) {
            self.cancelled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CountingTick;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fragments_before_a_tick_schedule_once() {
        let mut tick = CountingTick::default();
        let mut buf = StreamBuffer::default();
        for part in ["Hel", "lo wor", "ld"] {
            buf.append(part, &mut tick);
        }
        assert_eq!(tick.scheduled, 1);
        assert!(buf.is_scheduled());
        assert_eq!(buf.take_pending().as_deref(), Some("Hello world"));
        assert!(!buf.is_scheduled());
        assert_eq!(buf.pending(), "");
    }

    #[test]
    fn empty_flush_is_idempotent() {
        let mut buf = StreamBuffer::default();
        assert_eq!(buf.take_pending(), None);
        assert_eq!(buf.take_pending(), None);
        assert!(!buf.is_scheduled());
    }

    #[test]
    fn empty_fragment_does_not_schedule() {
        let mut tick = CountingTick::default();
        let mut buf = StreamBuffer::default();
        buf.append("", &mut tick);
        assert_eq!(tick.scheduled, 0);
        assert!(!buf.is_scheduled());
    }

    #[test]
    fn discard_cancels_outstanding_flush() {
        let mut tick = CountingTick::default();
        let mut buf = StreamBuffer::default();
        buf.append("tail", &mut tick);
        buf.discard(&mut tick);
        assert_eq!(tick.cancelled, 1);
        assert_eq!(buf.take_pending(), None);

        buf.discard(&mut tick);
        assert_eq!(tick.cancelled, 1);
    }

    #[test]
    fn frame_queue_dedupes_and_cancels_per_session() {
        let mut world = World::new();
        let a = world.spawn_empty().id();
        let b = world.spawn_empty().id();
        let mut queue = FrameFlushQueue::default();
        queue.scheduler_for(a).schedule_once();
        queue.scheduler_for(b).schedule_once();
        queue.scheduler_for(a).schedule_once();
        queue.scheduler_for(b).cancel();
        assert!(queue.is_scheduled(a));
        assert!(!queue.is_scheduled(b));
        assert_eq!(queue.take(), vec![a]);
        assert!(queue.take().is_empty());
    }
}
