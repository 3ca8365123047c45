//! Change signals with explicit subscription lists.
//!
//! A subscription may name a receiver model. The slot only keeps a weak
//! pointer to it, so a dropped receiver never keeps the sender alive and its
//! slots are pruned on the next emission.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{AttrChange, ChangeNotice, ModelInner};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Handle returned by every `connect`-style call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

pub type Callback = Rc<dyn Fn(&ChangeNotice<'_>)>;

struct Slot {
    id: SubscriptionId,
    /// `None` listens to every attribute.
    attr: Option<String>,
    receiver: Option<Weak<ModelInner>>,
    callback: Callback,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.receiver.as_ref().map_or(true, |r| r.strong_count() > 0)
    }
}

#[derive(Default)]
pub(crate) struct Signaller {
    slots: RefCell<Vec<Slot>>,
}

impl Signaller {
    pub(crate) fn connect(
        &self,
        attr: Option<&str>,
        receiver: Option<Weak<ModelInner>>,
        callback: Callback,
    ) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.slots.borrow_mut().push(Slot {
            id,
            attr: attr.map(str::to_string),
            receiver,
            callback,
        });
        id
    }

    pub(crate) fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|s| s.id != id);
        slots.len() != before
    }

    pub(crate) fn clear(&self) {
        self.slots.borrow_mut().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Snapshot the callbacks listening to `attr` (blanket ones when `None`).
    fn listeners(&self, attr: Option<&str>) -> Vec<Callback> {
        let mut slots = self.slots.borrow_mut();
        slots.retain(Slot::is_live);
        slots
            .iter()
            .filter(|s| s.attr.as_deref() == attr)
            .map(|s| s.callback.clone())
            .collect()
    }

    /// One per-attribute emission per change, then one blanket emission.
    ///
    /// Callbacks are cloned out first so they may connect or disconnect on
    /// this signaller while running.
    pub(crate) fn emit(&self, notice: &ChangeNotice<'_>) {
        for change in notice.changes {
            let single = ChangeNotice {
                model: notice.model,
                changes: std::slice::from_ref::<AttrChange>(change),
                setter_id: notice.setter_id,
            };
            for callback in self.listeners(Some(&change.attr)) {
                callback(&single);
            }
        }
        for callback in self.listeners(None) {
            callback(notice);
        }
    }
}
