//! Intrusive linked lists.
//!
//! Both flavours keep the link node inside the element itself, so pushing
//! and popping never allocate. That property is what lets IRQ-context code
//! (timer tick, I/O completion) move elements between queues.
//!
//! - [`List`] is a doubly-linked list whose structure is protected by an
//!   external lock (the scheduler's queue lock, a dentry's child lock).
//! - [`AtomicForwardList`] is a lock-free singly-linked push list used for
//!   wait queues and cache buckets, safe to push from IRQ context.
//!
//! Elements are passed as [`NonNull`] pointers; the caller owns lifetime
//! management and guarantees an element is on at most one list at a time.
//! The embedded node tracks a `linked` flag so violations are caught by
//! debug assertions instead of corrupting the chain.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

// ---------------------------------------------------------------------------
// Doubly-linked list
// ---------------------------------------------------------------------------

/// Link node embedded in an element of a [`List`].
pub struct Node<T> {
    next: Cell<Option<NonNull<T>>>,
    prev: Cell<Option<NonNull<T>>>,
    linked: Cell<bool>,
}

// SAFETY: Node fields are only touched while the external lock protecting
// the owning List is held, which serializes all access.
unsafe impl<T> Send for Node<T> {}
// SAFETY: See above.
unsafe impl<T> Sync for Node<T> {}

impl<T> Node<T> {
    /// Creates an unlinked node.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: Cell::new(None),
            prev: Cell::new(None),
            linked: Cell::new(false),
        }
    }

    /// Returns whether this node is currently on a list.
    pub fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that embed a [`Node`] and can live on a [`List`].
///
/// # Safety
///
/// `node()` must always return the same embedded node for the same element.
pub unsafe trait Linked: Sized {
    /// Returns the embedded link node.
    fn node(&self) -> &Node<Self>;
}

/// An intrusive doubly-linked list.
///
/// The list stores raw element pointers and never allocates. All structure
/// mutations must happen under the caller's lock.
pub struct List<T: Linked> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    len: usize,
}

// SAFETY: The list only holds pointers; all access is serialized by the
// caller's lock.
unsafe impl<T: Linked> Send for List<T> {}

impl<T: Linked> List<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Returns the number of elements on the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an element at the tail.
    ///
    /// # Safety
    ///
    /// `elem` must stay alive (and its address stable) until it is removed,
    /// and must not currently be on any list.
    pub unsafe fn push_back(&mut self, elem: NonNull<T>) {
        // SAFETY: Caller guarantees `elem` is valid.
        let node = unsafe { elem.as_ref() }.node();
        debug_assert!(!node.is_linked(), "element already on a list");
        node.linked.set(true);
        node.next.set(None);
        node.prev.set(self.tail);

        match self.tail {
            // SAFETY: `tail` was pushed earlier and is still alive.
            Some(tail) => unsafe { tail.as_ref() }.node().next.set(Some(elem)),
            None => self.head = Some(elem),
        }
        self.tail = Some(elem);
        self.len += 1;
    }

    /// Inserts an element at the head.
    ///
    /// # Safety
    ///
    /// Same contract as [`List::push_back`].
    pub unsafe fn push_front(&mut self, elem: NonNull<T>) {
        // SAFETY: Caller guarantees `elem` is valid.
        let node = unsafe { elem.as_ref() }.node();
        debug_assert!(!node.is_linked(), "element already on a list");
        node.linked.set(true);
        node.prev.set(None);
        node.next.set(self.head);

        match self.head {
            // SAFETY: `head` was pushed earlier and is still alive.
            Some(head) => unsafe { head.as_ref() }.node().prev.set(Some(elem)),
            None => self.tail = Some(elem),
        }
        self.head = Some(elem);
        self.len += 1;
    }

    /// Removes and returns the head element.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        // SAFETY: Elements on the list are alive per the push contract.
        let node = unsafe { head.as_ref() }.node();
        self.head = node.next.get();
        match self.head {
            // SAFETY: As above.
            Some(new_head) => unsafe { new_head.as_ref() }.node().prev.set(None),
            None => self.tail = None,
        }
        node.next.set(None);
        node.prev.set(None);
        node.linked.set(false);
        self.len -= 1;
        Some(head)
    }

    /// Unlinks an arbitrary element.
    ///
    /// # Safety
    ///
    /// `elem` must currently be on *this* list.
    pub unsafe fn remove(&mut self, elem: NonNull<T>) {
        // SAFETY: Caller guarantees `elem` is on this list and alive.
        let node = unsafe { elem.as_ref() }.node();
        debug_assert!(node.is_linked(), "element not on a list");
        let prev = node.prev.get();
        let next = node.next.get();

        match prev {
            // SAFETY: Neighbours on the list are alive.
            Some(p) => unsafe { p.as_ref() }.node().next.set(next),
            None => self.head = next,
        }
        match next {
            // SAFETY: As above.
            Some(n) => unsafe { n.as_ref() }.node().prev.set(prev),
            None => self.tail = prev,
        }
        node.next.set(None);
        node.prev.set(None);
        node.linked.set(false);
        self.len -= 1;
    }

    /// Iterates over the elements front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.head,
            _list: PhantomData,
        }
    }
}

impl<T: Linked> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowing iterator over a [`List`].
pub struct Iter<'a, T: Linked> {
    cursor: Option<NonNull<T>>,
    _list: PhantomData<&'a List<T>>,
}

impl<'a, T: Linked> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let cur = self.cursor?;
        // SAFETY: Elements on the list are alive for the list borrow.
        let r = unsafe { cur.as_ref() };
        self.cursor = r.node().next.get();
        Some(r)
    }
}

// ---------------------------------------------------------------------------
// Atomic forward list
// ---------------------------------------------------------------------------

/// Link node embedded in an element of an [`AtomicForwardList`].
pub struct ForwardNode<T> {
    next: AtomicPtr<T>,
}

impl<T> ForwardNode<T> {
    /// Creates an unlinked node.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<T> Default for ForwardNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that embed a [`ForwardNode`] and can live on an
/// [`AtomicForwardList`].
///
/// # Safety
///
/// `forward_node()` must always return the same embedded node for the same
/// element.
pub unsafe trait ForwardLinked: Sized {
    /// Returns the embedded link node.
    fn forward_node(&self) -> &ForwardNode<Self>;
}

/// A lock-free singly-linked push list with an atomic `first` pointer.
///
/// Producers push with a CAS loop; the consumer detaches the whole chain
/// with [`AtomicForwardList::take_all`] and walks it exclusively. LIFO
/// order — callers that need FIFO reverse while draining.
pub struct AtomicForwardList<T: ForwardLinked> {
    first: AtomicPtr<T>,
}

// SAFETY: All shared state is a single atomic pointer.
unsafe impl<T: ForwardLinked> Send for AtomicForwardList<T> {}
// SAFETY: As above.
unsafe impl<T: ForwardLinked> Sync for AtomicForwardList<T> {}

impl<T: ForwardLinked> AtomicForwardList<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns whether the list currently looks empty.
    pub fn is_empty(&self) -> bool {
        self.first.load(Ordering::Acquire).is_null()
    }

    /// Pushes an element onto the front.
    ///
    /// # Safety
    ///
    /// `elem` must stay alive until it is drained via `take_all`, and must
    /// not currently be on any forward list.
    pub unsafe fn push(&self, elem: NonNull<T>) {
        // SAFETY: Caller guarantees `elem` is valid.
        let node = unsafe { elem.as_ref() }.forward_node();
        let mut head = self.first.load(Ordering::Relaxed);
        loop {
            node.next.store(head, Ordering::Relaxed);
            match self.first.compare_exchange_weak(
                head,
                elem.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Detaches the entire chain and returns a draining iterator.
    ///
    /// After this call the list is empty; the returned chain is owned
    /// exclusively by the caller.
    pub fn take_all(&self) -> Drain<T> {
        let head = self.first.swap(ptr::null_mut(), Ordering::AcqRel);
        Drain { cursor: head }
    }
}

impl<T: ForwardLinked> Default for AtomicForwardList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive iterator over a detached forward-list chain.
pub struct Drain<T: ForwardLinked> {
    cursor: *mut T,
}

impl<T: ForwardLinked> Iterator for Drain<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let cur = NonNull::new(self.cursor)?;
        // SAFETY: The chain was detached; we own it exclusively and the
        // push contract keeps elements alive until drained.
        let node = unsafe { cur.as_ref() }.forward_node();
        self.cursor = node.next.load(Ordering::Relaxed);
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        node: Node<Item>,
        fwd: ForwardNode<Item>,
        value: u32,
    }

    // SAFETY: `node` is the embedded link node.
    unsafe impl Linked for Item {
        fn node(&self) -> &Node<Self> {
            &self.node
        }
    }

    // SAFETY: `fwd` is the embedded forward link node.
    unsafe impl ForwardLinked for Item {
        fn forward_node(&self) -> &ForwardNode<Self> {
            &self.fwd
        }
    }

    fn make(value: u32) -> NonNull<Item> {
        let boxed = Box::new(Item {
            node: Node::new(),
            fwd: ForwardNode::new(),
            value,
        });
        NonNull::new(Box::into_raw(boxed)).unwrap()
    }

    fn free(ptr: NonNull<Item>) {
        // SAFETY: `ptr` came from Box::into_raw and is off all lists.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }

    #[test]
    fn push_pop_fifo() {
        let mut list = List::new();
        let (a, b, c) = (make(1), make(2), make(3));
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
        }
        assert_eq!(list.len(), 3);
        for expect in 1..=3u32 {
            let popped = list.pop_front().unwrap();
            assert_eq!(unsafe { popped.as_ref() }.value, expect);
            free(popped);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn remove_middle() {
        let mut list = List::new();
        let (a, b, c) = (make(1), make(2), make(3));
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
            list.remove(b);
        }
        assert_eq!(list.len(), 2);
        assert!(!unsafe { b.as_ref() }.node().is_linked());
        let values: Vec<u32> = list.iter().map(|i| i.value).collect();
        assert_eq!(values, [1, 3]);
        while let Some(p) = list.pop_front() {
            free(p);
        }
        free(b);
    }

    #[test]
    fn push_front_orders() {
        let mut list = List::new();
        let (a, b) = (make(1), make(2));
        unsafe {
            list.push_front(a);
            list.push_front(b);
        }
        let values: Vec<u32> = list.iter().map(|i| i.value).collect();
        assert_eq!(values, [2, 1]);
        while let Some(p) = list.pop_front() {
            free(p);
        }
    }

    #[test]
    fn linked_flag_tracks_membership() {
        let mut list = List::new();
        let a = make(7);
        assert!(!unsafe { a.as_ref() }.node().is_linked());
        unsafe { list.push_back(a) };
        assert!(unsafe { a.as_ref() }.node().is_linked());
        let popped = list.pop_front().unwrap();
        assert!(!unsafe { popped.as_ref() }.node().is_linked());
        free(popped);
    }

    #[test]
    fn forward_list_take_all_drains() {
        let list = AtomicForwardList::new();
        let (a, b, c) = (make(1), make(2), make(3));
        unsafe {
            list.push(a);
            list.push(b);
            list.push(c);
        }
        assert!(!list.is_empty());
        // LIFO push order.
        let values: Vec<u32> = list
            .take_all()
            .map(|p| {
                let v = unsafe { p.as_ref() }.value;
                free(p);
                v
            })
            .collect();
        assert_eq!(values, [3, 2, 1]);
        assert!(list.is_empty());
    }

    #[test]
    fn forward_list_concurrent_push() {
        use std::sync::Arc;
        let list = Arc::new(AtomicForwardList::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let list = Arc::clone(&list);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    unsafe { list.push(make(t * 100 + i)) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let drained: Vec<NonNull<Item>> = list.take_all().collect();
        assert_eq!(drained.len(), 400);
        for p in drained {
            free(p);
        }
    }
}
