//! Outbound serial allocation and ack/nack correlation.
//!
//! Every ackable frame gets a contiguous range of `msgSerial`s when it is
//! handed to the transport. The server confirms ranges with `ack` / `nack`
//! frames whose batching need not match the send-time batching, so a
//! confirmation for `[S, E]` resolves every pending frame that ends at or
//! below `E`, head first. Callers therefore always observe completions in
//! publish order.

use std::collections::VecDeque;
use std::fmt;

use rt_domain::{codes, ErrorInfo};
use rt_protocol::ProtocolMessage;

/// Completion for one publish call.
pub type AckCallback = Box<dyn FnOnce(Result<(), ErrorInfo>) + Send>;

/// One outbound frame awaiting confirmation.
pub struct PendingMessage {
    pub start_serial: u64,
    pub count: u32,
    pub frame: ProtocolMessage,
    callbacks: Vec<AckCallback>,
    /// Set when a nack covered part of this frame's range; the frame then
    /// resolves with this error once the rest of its range is confirmed.
    partial_error: Option<ErrorInfo>,
}

impl PendingMessage {
    pub fn new(start_serial: u64, count: u32, frame: ProtocolMessage, callbacks: Vec<AckCallback>) -> Self {
        Self {
            start_serial,
            count: count.max(1),
            frame,
            callbacks,
            partial_error: None,
        }
    }

    pub fn end_serial(&self) -> u64 {
        self.start_serial + u64::from(self.count) - 1
    }

    fn resolve(self, result: Result<(), ErrorInfo>) {
        let result = match (result, self.partial_error) {
            (Ok(()), Some(err)) => Err(err),
            (result, _) => result,
        };
        for cb in self.callbacks {
            cb(result.clone());
        }
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMessage")
            .field("start_serial", &self.start_serial)
            .field("count", &self.count)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct AckTracker {
    msg_serial: u64,
    pending: VecDeque<PendingMessage>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous serials, returning the first.
    pub fn next_serial(&mut self, count: u32) -> u64 {
        let start = self.msg_serial;
        self.msg_serial += u64::from(count.max(1));
        start
    }

    /// The serial the next frame will get.
    pub fn msg_serial(&self) -> u64 {
        self.msg_serial
    }

    /// Seed the counter, e.g. from a recovery key.
    pub fn set_msg_serial(&mut self, serial: u64) {
        self.msg_serial = serial;
    }

    pub fn enqueue(&mut self, message: PendingMessage) {
        if let Some(last) = self.pending.back() {
            if message.start_serial <= last.end_serial() {
                tracing::error!(
                    start_serial = message.start_serial,
                    last_serial = last.end_serial(),
                    "pending message enqueued out of serial order"
                );
            }
        }
        self.pending.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Frames still awaiting confirmation, in serial order, for resending
    /// on a resumed connection.
    pub fn pending_frames(&self) -> Vec<ProtocolMessage> {
        self.pending.iter().map(|p| p.frame.clone()).collect()
    }

    pub fn on_ack(&mut self, serial: u64, count: u32) {
        self.resolve_range(serial, count, None);
    }

    pub fn on_nack(&mut self, serial: u64, count: u32, error: ErrorInfo) {
        self.resolve_range(serial, count, Some(error));
    }

    /// Fail every pending frame, e.g. when the connection closes or fails.
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for pending in std::mem::take(&mut self.pending) {
            pending.resolve(Err(error.clone()));
        }
    }

    /// A fresh session replaced the previous one: nothing pending can be
    /// confirmed any more and serials restart at zero.
    pub fn reset_for_new_connection(&mut self, error: Option<ErrorInfo>) {
        if !self.pending.is_empty() {
            let error = error.unwrap_or_else(|| {
                ErrorInfo::new(
                    codes::CONNECTION_RESUME_FAILED,
                    400,
                    "connection changed; pending messages were not confirmed",
                )
            });
            tracing::info!(
                pending = self.pending.len(),
                code = error.code,
                "failing pending messages after connection change"
            );
            self.fail_all(&error);
        }
        self.msg_serial = 0;
    }

    fn resolve_range(&mut self, serial: u64, count: u32, nack: Option<ErrorInfo>) {
        let kind = if nack.is_some() { "nack" } else { "ack" };
        if serial >= self.msg_serial {
            tracing::warn!(
                serial,
                count,
                msg_serial = self.msg_serial,
                "{kind} for unallocated serial ignored"
            );
            return;
        }
        let mut end = serial + u64::from(count.max(1)) - 1;
        if end >= self.msg_serial {
            tracing::warn!(
                serial,
                end,
                msg_serial = self.msg_serial,
                "{kind} range extends past allocated serials; clamped"
            );
            end = self.msg_serial - 1;
        }

        let head_start = match self.pending.front() {
            Some(head) => head.start_serial,
            None => {
                tracing::debug!(serial, count, "{kind} with nothing pending");
                return;
            }
        };
        if end < head_start {
            tracing::debug!(serial, end, head_start, "{kind} for already resolved serials");
            return;
        }

        let mut resolved = Vec::new();
        while let Some(head) = self.pending.front() {
            if head.end_serial() > end {
                break;
            }
            if let Some(pending) = self.pending.pop_front() {
                let result = match &nack {
                    Some(err) if pending.end_serial() >= serial => Err(err.clone()),
                    _ => Ok(()),
                };
                resolved.push((pending, result));
            }
        }

        // A frame straddling the end of the range stays pending; a nack
        // still taints it.
        if let (Some(err), Some(head)) = (&nack, self.pending.front_mut()) {
            if head.start_serial <= end {
                head.partial_error = Some(err.clone());
            }
        }

        for (pending, result) in resolved {
            pending.resolve(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(u64, Result<(), u32>)>>>;

    fn enqueue(tracker: &mut AckTracker, log: &Log, count: u32) -> u64 {
        let start = tracker.next_serial(count);
        let log = log.clone();
        let cb: AckCallback = Box::new(move |r| {
            log.lock().unwrap().push((start, r.map_err(|e| e.code)));
        });
        tracker.enqueue(PendingMessage::new(
            start,
            count,
            ProtocolMessage::publish("chat", vec![]),
            vec![cb],
        ));
        start
    }

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn denied() -> ErrorInfo {
        ErrorInfo::new(codes::OPERATION_NOT_PERMITTED, 401, "denied")
    }

    #[test]
    fn allocates_contiguous_serials() {
        let mut t = AckTracker::new();
        assert_eq!(t.next_serial(1), 0);
        assert_eq!(t.next_serial(3), 1);
        assert_eq!(t.next_serial(1), 4);
        assert_eq!(t.msg_serial(), 5);
    }

    #[test]
    fn exact_acks_resolve_in_order() {
        let mut t = AckTracker::new();
        let log = new_log();
        for _ in 0..3 {
            enqueue(&mut t, &log, 1);
        }
        t.on_ack(0, 1);
        t.on_ack(1, 1);
        t.on_ack(2, 1);
        assert_eq!(*log.lock().unwrap(), vec![(0, Ok(())), (1, Ok(())), (2, Ok(()))]);
        assert!(t.is_empty());
    }

    #[test]
    fn higher_ack_first_subsumes_lower_ranges_fifo() {
        let mut t = AckTracker::new();
        let log = new_log();
        for _ in 0..3 {
            enqueue(&mut t, &log, 1);
        }
        t.on_ack(2, 1);
        // Late acks for lower serials are no-ops.
        t.on_ack(0, 1);
        t.on_ack(1, 1);
        assert_eq!(*log.lock().unwrap(), vec![(0, Ok(())), (1, Ok(())), (2, Ok(()))]);
    }

    #[test]
    fn batched_ack_covers_several_frames() {
        let mut t = AckTracker::new();
        let log = new_log();
        for _ in 0..4 {
            enqueue(&mut t, &log, 1);
        }
        t.on_ack(0, 3);
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(t.len(), 1);
        t.on_ack(3, 1);
        assert!(t.is_empty());
    }

    #[test]
    fn ack_inside_multi_serial_frame_keeps_it_pending() {
        let mut t = AckTracker::new();
        let log = new_log();
        enqueue(&mut t, &log, 3); // serials 0..=2
        t.on_ack(0, 2);
        assert!(log.lock().unwrap().is_empty());
        t.on_ack(2, 1);
        assert_eq!(*log.lock().unwrap(), vec![(0, Ok(()))]);
    }

    #[test]
    fn nack_resolves_earlier_entries_as_success() {
        let mut t = AckTracker::new();
        let log = new_log();
        for _ in 0..3 {
            enqueue(&mut t, &log, 1);
        }
        t.on_nack(1, 1, denied());
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, Ok(())), (1, Err(codes::OPERATION_NOT_PERMITTED))]
        );
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn partial_nack_taints_straddling_frame() {
        let mut t = AckTracker::new();
        let log = new_log();
        enqueue(&mut t, &log, 2); // 0..=1
        t.on_nack(0, 1, denied());
        assert!(log.lock().unwrap().is_empty());
        t.on_ack(1, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, Err(codes::OPERATION_NOT_PERMITTED))]
        );
    }

    #[test]
    fn ack_for_unallocated_serial_is_ignored() {
        let mut t = AckTracker::new();
        let log = new_log();
        enqueue(&mut t, &log, 1);
        t.on_ack(5, 1);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn overlong_ack_is_clamped() {
        let mut t = AckTracker::new();
        let log = new_log();
        enqueue(&mut t, &log, 1);
        enqueue(&mut t, &log, 1);
        t.on_ack(0, 10);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn new_connection_fails_pending_and_resets_serial() {
        let mut t = AckTracker::new();
        let log = new_log();
        enqueue(&mut t, &log, 1);
        enqueue(&mut t, &log, 1);
        t.reset_for_new_connection(None);
        assert_eq!(t.msg_serial(), 0);
        assert!(t.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (0, Err(codes::CONNECTION_RESUME_FAILED)),
                (1, Err(codes::CONNECTION_RESUME_FAILED))
            ]
        );
    }

    #[test]
    fn pending_frames_preserve_order() {
        let mut t = AckTracker::new();
        let log = new_log();
        for _ in 0..3 {
            enqueue(&mut t, &log, 1);
        }
        t.on_ack(0, 1);
        assert_eq!(t.pending_frames().len(), 2);
    }
}
