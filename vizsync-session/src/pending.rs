//! Requests awaiting a correlated reply.

use std::cell::RefCell;
use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::protocol::Message;

/// Outstanding requests keyed by message id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    table: RefCell<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub(crate) fn insert(&self, msgid: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.table.borrow_mut().insert(msgid.to_string(), tx);
        rx
    }

    /// Route a reply to its waiter. Returns the reply back when nobody is
    /// waiting for it.
    pub(crate) fn resolve(&self, reply: Message) -> Result<(), Message> {
        let Some(reqid) = reply.reqid() else {
            return Err(reply);
        };
        let waiter = self.table.borrow_mut().remove(reqid);
        match waiter {
            Some(tx) => tx.send(reply),
            None => Err(reply),
        }
    }

    pub(crate) fn remove(&self, msgid: &str) -> bool {
        self.table.borrow_mut().remove(msgid).is_some()
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.table.borrow_mut().drain().collect();
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.borrow().len()
    }
}

/// Removes a pending entry when the awaiting future finishes or is dropped.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    msgid: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingRequests, msgid: &str) -> Self {
        Self {
            pending,
            msgid: msgid.to_string(),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.msgid) {
            log::debug!("abandoned request {}", self.msgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_delivers_reply() {
        let pending = PendingRequests::default();
        let req = Message::pull_doc_req();
        let mut rx = pending.insert(req.msgid());

        let reply = Message::ok(req.msgid());
        assert!(pending.resolve(reply.clone()).is_ok());
        assert_eq!(rx.try_recv().unwrap(), reply);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_unmatched_reply_returned() {
        let pending = PendingRequests::default();
        let reply = Message::ok("nobody");
        assert_eq!(pending.resolve(reply.clone()), Err(reply));
        assert!(pending.resolve(Message::ack()).is_err());
    }

    #[test]
    fn test_guard_removes_entry() {
        let pending = PendingRequests::default();
        let _rx = pending.insert("r1");
        {
            let _guard = PendingGuard::new(&pending, "r1");
            assert_eq!(pending.len(), 1);
        }
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_fail_all_closes_waiters() {
        let pending = PendingRequests::default();
        let mut a = pending.insert("a");
        let mut b = pending.insert("b");
        assert_eq!(pending.fail_all(), 2);
        assert!(matches!(a.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert!(matches!(b.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }
}
