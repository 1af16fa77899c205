//! Recency ordering for idle-timeout sweeps.
//!
//! A doubly-linked list threaded through connection tokens (slab keys):
//! most-recently-active at the head, so a sweep walks from the tail and stops
//! at the first non-expired connection, touching only expired nodes.

const NONE: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
    in_list: bool,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            prev: NONE,
            next: NONE,
            in_list: false,
        }
    }
}

pub(crate) struct RecencyList {
    links: Vec<Link>,
    head: usize,
    tail: usize,
}

impl RecencyList {
    pub(crate) fn new() -> Self {
        RecencyList {
            links: Vec::new(),
            head: NONE,
            tail: NONE,
        }
    }

    fn link_mut(&mut self, token: usize) -> &mut Link {
        if token >= self.links.len() {
            self.links.resize_with(token + 1, Link::default);
        }
        &mut self.links[token]
    }

    /// Insert `token` at the head. The token must not already be listed.
    pub(crate) fn push_front(&mut self, token: usize) {
        let old_head = self.head;
        {
            let link = self.link_mut(token);
            debug_assert!(!link.in_list, "token already in recency list");
            link.prev = NONE;
            link.next = old_head;
            link.in_list = true;
        }
        if old_head != NONE {
            self.links[old_head].prev = token;
        } else {
            self.tail = token;
        }
        self.head = token;
    }

    /// Remove `token` from the list; harmless if it is not listed.
    pub(crate) fn detach(&mut self, token: usize) {
        if token >= self.links.len() || !self.links[token].in_list {
            return;
        }
        let Link { prev, next, .. } = self.links[token];
        if prev != NONE {
            self.links[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.links[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.links[token] = Link::default();
    }

    /// Move `token` to the head (it just saw activity).
    pub(crate) fn touch(&mut self, token: usize) {
        self.detach(token);
        self.push_front(token);
    }

    /// Least-recently-active token.
    pub(crate) fn back(&self) -> Option<usize> {
        if self.tail == NONE {
            None
        } else {
            Some(self.tail)
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.iter_lru().len()
    }

    #[cfg(test)]
    fn iter_lru(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut at = self.tail;
        while at != NONE {
            out.push(at);
            at = self.links[at].prev;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_order() {
        let mut list = RecencyList::new();
        list.push_front(0);
        list.push_front(1);
        list.push_front(2);
        // 0 is oldest.
        assert_eq!(list.iter_lru(), vec![0, 1, 2]);
        assert_eq!(list.back(), Some(0));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_touch_moves_to_front() {
        let mut list = RecencyList::new();
        list.push_front(0);
        list.push_front(1);
        list.push_front(2);
        list.touch(0);
        assert_eq!(list.iter_lru(), vec![1, 2, 0]);
        assert_eq!(list.back(), Some(1));
    }

    #[test]
    fn test_detach() {
        let mut list = RecencyList::new();
        list.push_front(5);
        list.push_front(9);
        list.detach(5);
        assert_eq!(list.iter_lru(), vec![9]);
        assert_eq!(list.back(), Some(9));

        // Detaching twice is harmless.
        list.detach(5);
        assert_eq!(list.len(), 1);

        list.detach(9);
        assert_eq!(list.back(), None);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_token_reuse_after_detach() {
        let mut list = RecencyList::new();
        list.push_front(0);
        list.push_front(1);
        list.detach(0);
        list.push_front(0);
        assert_eq!(list.iter_lru(), vec![1, 0]);
    }
}
