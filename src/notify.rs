//! Observer fan-out used for swarm lifecycle events.
//!
//! A [`Listeners`] is a small callback list keyed by subscription id;
//! observers register a closure and may drop out again at any time. The
//! whole list dies with its owner, so subscriptions never outlive the
//! swarm they observe.

/// Token returned from [`Listeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Box<dyn Fn(&E) + Send>;

pub struct Listeners<E> {
    next_id: u64,
    subscribers: Vec<(ListenerId, Callback<E>)>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, callback));
        id
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    pub fn emit(&self, event: &E) {
        for (_, callback) in &self.subscribers {
            callback(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
