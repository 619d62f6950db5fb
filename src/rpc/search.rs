//! Iterative `get_peers` / `find_node` lookups and their registry.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::{Id, Method};

/// Searches are keyed by 15 bits sequence numbers, so that [crate::common::NO_SEARCH]
/// is never allocated.
pub const MAX_SEARCHES: usize = 1 << 15;

/// Receives every peer found by a search, then a single `None` once it is done.
pub type SearchCallback = Box<dyn FnMut(Option<SocketAddrV4>) + Send>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchError {
    /// Too many searches are in progress, try again later.
    #[error("Too many concurrent searches")]
    Exhausted,
    /// A search for the same target and method is already in progress.
    #[error("Search already in progress")]
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of [Search::acknowledge].
pub enum Acknowledgement {
    /// First reply from this candidate.
    First,
    /// The candidate already replied, a duplicate or retransmitted datagram.
    Repeated,
    /// Not a candidate of this search.
    Unknown,
}

#[derive(Debug, Clone)]
/// A node queried, or about to be queried, by a search.
pub struct Candidate {
    pub id: Id,
    pub address: SocketAddrV4,
    /// The node replied.
    pub acked: bool,
    /// When the query was sent, `None` if not sent yet.
    pub queried_at: Option<Instant>,
    /// Token from the node's `get_peers` reply, needed to announce to it.
    pub token: Option<Vec<u8>>,
}

/// State of a single iterative lookup.
pub struct Search {
    target: Id,
    method: Method,
    callback: SearchCallback,
    candidates: Vec<Candidate>,
    max_candidates: usize,
    /// Announce ourselves to the responding nodes once done,
    /// with an explicit port or `None` for the implied port.
    announce: Option<Option<u16>>,
}

impl Search {
    pub fn new(target: Id, method: Method, max_candidates: usize, callback: SearchCallback) -> Self {
        Search {
            target,
            method,
            callback,
            candidates: Vec::with_capacity(max_candidates),
            max_candidates,
            announce: None,
        }
    }

    /// Announce to the responding nodes once this search is done.
    pub fn with_announce(mut self, port: Option<u16>) -> Self {
        self.announce = Some(port);
        self
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn announce(&self) -> Option<Option<u16>> {
        self.announce
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn get(&self, id: &Id) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.id == id)
    }

    // === Public Methods ===

    /// Add a candidate, returns `true` if it is new and there was room for it.
    pub fn insert(&mut self, id: Id, address: SocketAddrV4) -> bool {
        if self.get(&id).is_some() || self.candidates.len() >= self.max_candidates {
            return false;
        }

        self.candidates.push(Candidate {
            id,
            address,
            acked: false,
            queried_at: None,
            token: None,
        });

        true
    }

    /// Record that `id` was just queried.
    pub fn queried(&mut self, id: &Id) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| &c.id == id) {
            candidate.queried_at = Some(Instant::now());
        }
    }

    /// Candidates not queried yet.
    pub fn pending(&self) -> Vec<(Id, SocketAddrV4)> {
        self.candidates
            .iter()
            .filter(|c| c.queried_at.is_none())
            .map(|c| (c.id, c.address))
            .collect()
    }

    /// Mark `id` as having replied, keeping the latest token it sent.
    pub fn acknowledge(&mut self, id: &Id, token: Option<Vec<u8>>) -> Acknowledgement {
        let Some(candidate) = self.candidates.iter_mut().find(|c| &c.id == id) else {
            return Acknowledgement::Unknown;
        };

        if token.is_some() {
            candidate.token = token;
        }

        if candidate.acked {
            Acknowledgement::Repeated
        } else {
            candidate.acked = true;
            Acknowledgement::First
        }
    }

    /// Done when every candidate replied, or, given a `timeout`, when every
    /// candidate still waited for was queried more than `timeout` ago.
    pub fn is_done(&self, now: Instant, timeout: Option<Duration>) -> bool {
        self.candidates.iter().all(|c| {
            c.acked
                || timeout.is_some_and(|timeout| {
                    c.queried_at
                        .map_or(true, |at| now.saturating_duration_since(at) > timeout)
                })
        })
    }

    /// Deliver a found peer, or `None` when done.
    pub fn notify(&mut self, peer: Option<SocketAddrV4>) {
        (self.callback)(peer)
    }
}

impl Debug for Search {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("target", &self.target)
            .field("method", &self.method)
            .field("candidates", &self.candidates.len())
            .field("announce", &self.announce)
            .finish()
    }
}

#[derive(Debug, Default)]
/// Open searches by sequence number.
pub struct Searches {
    next: u16,
    searches: HashMap<u16, Search>,
}

impl Searches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }

    pub fn get(&self, sequence: u16) -> Option<&Search> {
        self.searches.get(&sequence)
    }

    pub fn get_mut(&mut self, sequence: u16) -> Option<&mut Search> {
        self.searches.get_mut(&sequence)
    }

    pub fn remove(&mut self, sequence: u16) -> Option<Search> {
        self.searches.remove(&sequence)
    }

    /// Sequence number of the open search for `target` using `method`.
    pub fn find(&self, target: &Id, method: Method) -> Option<u16> {
        self.searches
            .iter()
            .find(|(_, search)| search.target() == target && search.method() == method)
            .map(|(sequence, _)| *sequence)
    }

    /// Next free sequence number, wrapping and probing for a free slot.
    pub fn next_sequence(&mut self) -> Result<u16, SearchError> {
        if self.searches.len() >= MAX_SEARCHES {
            return Err(SearchError::Exhausted);
        }

        for _ in 0..MAX_SEARCHES {
            let sequence = self.next;
            self.next = (self.next + 1) % MAX_SEARCHES as u16;

            if !self.searches.contains_key(&sequence) {
                return Ok(sequence);
            }
        }

        Err(SearchError::Exhausted)
    }

    /// Register a search under a sequence number from [Self::next_sequence].
    pub fn insert(&mut self, sequence: u16, search: Search) {
        self.searches.insert(sequence, search);
    }

    /// Sequence numbers of searches done by `now`, given `timeout`.
    pub fn done(&self, now: Instant, timeout: Duration) -> Vec<u16> {
        self.searches
            .iter()
            .filter(|(_, search)| search.is_done(now, Some(timeout)))
            .map(|(sequence, _)| *sequence)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn noop() -> SearchCallback {
        Box::new(|_| {})
    }

    fn address(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn candidates_are_bounded() {
        let mut search = Search::new(Id::random(), Method::GetPeers, 4, noop());

        let id = Id::random();
        assert!(search.insert(id, address(1)));
        assert!(!search.insert(id, address(1)));

        for i in 0..10 {
            search.insert(Id::random(), address(i));
        }

        assert_eq!(search.len(), 4);
    }

    #[test]
    fn done_when_all_acked() {
        let mut search = Search::new(Id::random(), Method::GetPeers, 16, noop());
        let now = Instant::now();

        assert!(search.is_done(now, None));

        let a = Id::random();
        let b = Id::random();
        search.insert(a, address(1));
        search.insert(b, address(2));

        assert!(!search.is_done(now, None));
        assert_eq!(search.acknowledge(&a, Some(vec![1])), Acknowledgement::First);
        assert!(!search.is_done(now, None));
        assert_eq!(search.acknowledge(&b, None), Acknowledgement::First);
        assert!(search.is_done(now, None));

        assert_eq!(
            search.acknowledge(&Id::random(), None),
            Acknowledgement::Unknown
        );
        assert_eq!(search.get(&a).and_then(|c| c.token.clone()), Some(vec![1]));
    }

    #[test]
    fn repeated_reply_refreshes_token() {
        let mut search = Search::new(Id::random(), Method::GetPeers, 16, noop());

        let a = Id::random();
        search.insert(a, address(1));

        assert_eq!(search.acknowledge(&a, Some(vec![1])), Acknowledgement::First);
        assert_eq!(search.acknowledge(&a, None), Acknowledgement::Repeated);
        assert_eq!(search.get(&a).and_then(|c| c.token.clone()), Some(vec![1]));

        assert_eq!(search.acknowledge(&a, Some(vec![2])), Acknowledgement::Repeated);
        assert_eq!(search.get(&a).and_then(|c| c.token.clone()), Some(vec![2]));
    }

    #[test]
    fn done_after_timeout() {
        let mut search = Search::new(Id::random(), Method::FindNode, 16, noop());

        let id = Id::random();
        search.insert(id, address(1));
        search.queried(&id);
        assert!(search.pending().is_empty());

        let timeout = Duration::from_secs(60);

        assert!(!search.is_done(Instant::now(), Some(timeout)));
        assert!(search.is_done(Instant::now() + timeout * 2, Some(timeout)));
    }

    #[test]
    fn notify() {
        let found = Arc::new(Mutex::new(vec![]));
        let cloned = found.clone();

        let mut search = Search::new(
            Id::random(),
            Method::GetPeers,
            16,
            Box::new(move |peer| cloned.lock().unwrap().push(peer)),
        );

        search.notify(Some(address(1)));
        search.notify(None);

        assert_eq!(*found.lock().unwrap(), vec![Some(address(1)), None]);
    }

    #[test]
    fn sequences_wrap() {
        let mut searches = Searches::new();

        assert_eq!(searches.next_sequence(), Ok(0));
        assert_eq!(searches.next_sequence(), Ok(1));

        searches.insert(2, Search::new(Id::random(), Method::GetPeers, 16, noop()));
        assert_eq!(searches.next_sequence(), Ok(3));

        searches.next = MAX_SEARCHES as u16 - 1;
        assert_eq!(searches.next_sequence(), Ok(MAX_SEARCHES as u16 - 1));
        assert_eq!(searches.next_sequence(), Ok(0));
    }

    #[test]
    fn exhausted() {
        let mut searches = Searches::new();

        for _ in 0..MAX_SEARCHES {
            let sequence = searches.next_sequence().unwrap();
            searches.insert(
                sequence,
                Search::new(Id::random(), Method::GetPeers, 16, noop()),
            );
        }

        assert_eq!(searches.next_sequence(), Err(SearchError::Exhausted));

        searches.remove(42);
        assert_eq!(searches.next_sequence(), Ok(42));
    }

    #[test]
    fn find() {
        let mut searches = Searches::new();
        let target = Id::random();

        searches.insert(7, Search::new(target, Method::GetPeers, 16, noop()));

        assert_eq!(searches.find(&target, Method::GetPeers), Some(7));
        assert_eq!(searches.find(&target, Method::FindNode), None);
    }
}
