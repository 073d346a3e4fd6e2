//! Input device class.
//!
//! Input devices are character devices under major 13, one `/dev/eventN`
//! per device. Drivers push events from their IRQ handlers; events fan
//! out first through *handlers* (filters that may consume the event) and
//! then to *listeners* (per-consumer ring buffers, each with its own
//! wait queue).
//!
//! Waking listeners is not safe from arbitrary IRQ nesting, so
//! [`InputDevice::push_key_event`] defers delivery to a pending queue
//! when it runs in interrupt context; the interrupt exit path drains it
//! via [`run_deferred`].

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use planck_noalloc::ringbuf::RingBuf;

use boson_core::sync::{IrqSpinLock, SpinLock};
use boson_core::{Error, Result, kdebug};
use boson_sched::waitq::WaitQueue;

/// Character-device major number of the input class.
pub const INPUT_MAJOR: u32 = 13;

/// Maximum registered input devices.
const MAX_INPUT_DEVICES: usize = 32;

/// Events buffered per listener.
const LISTENER_RING: usize = 64;

/// Deferred events pending IRQ-exit delivery.
const DEFERRED_RING: usize = 128;

/// One input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Event class (key, relative axis, …).
    pub event_type: u16,
    /// Press / release / repeat.
    pub action: u16,
    /// Key or axis code.
    pub code: u16,
    /// Tick timestamp at push time.
    pub timestamp: u64,
}

/// A filter; returning `true` consumes the event.
pub type InputHandlerFn = fn(&InputEvent) -> bool;

/// A consumer's buffered view of one device's events.
pub struct InputListener {
    ring: IrqSpinLock<RingBuf<InputEvent, LISTENER_RING>>,
    /// Woken when events arrive.
    pub wait: WaitQueue,
}

impl InputListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: IrqSpinLock::new(RingBuf::new()),
            wait: WaitQueue::new(),
        })
    }

    /// Takes the oldest buffered event.
    #[must_use]
    pub fn pop_event(&self) -> Option<InputEvent> {
        self.ring.lock().pop()
    }

    /// Whether events are buffered.
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.ring.lock().is_empty()
    }

    fn push(&self, event: InputEvent) {
        let mut ring = self.ring.lock();
        if ring.try_push(event).is_err() {
            // Overflow: drop the oldest, keep the freshest.
            let _ = ring.pop();
            let _ = ring.try_push(event);
        }
    }
}

/// One registered input device (`/dev/event<minor>`).
pub struct InputDevice {
    /// Device name from the driver.
    pub name: String,
    /// Minor number; the node is `event<minor>`.
    pub minor: u32,
    handlers: SpinLock<Vec<InputHandlerFn>>,
    listeners: SpinLock<Vec<Arc<InputListener>>>,
}

static DEVICES: SpinLock<Vec<Arc<InputDevice>>> = SpinLock::new(Vec::new());

/// Deferred `(minor, event)` pairs pushed from IRQ context.
static DEFERRED: IrqSpinLock<RingBuf<(u32, InputEvent), DEFERRED_RING>> =
    IrqSpinLock::new(RingBuf::new());

/// Registers an input device, assigning the next minor.
///
/// # Errors
///
/// `MaxSize` when the event-node namespace is exhausted.
pub fn register_device(name: String) -> Result<Arc<InputDevice>> {
    let mut devices = DEVICES.lock();
    if devices.len() >= MAX_INPUT_DEVICES {
        return Err(Error::MaxSize);
    }
    let minor = devices.len() as u32;
    let device = Arc::new(InputDevice {
        name,
        minor,
        handlers: SpinLock::new(Vec::new()),
        listeners: SpinLock::new(Vec::new()),
    });
    kdebug!("input: event{} = '{}'", device.minor, device.name);
    devices.push(device.clone());
    Ok(device)
}

/// Finds a device by its minor number.
#[must_use]
pub fn device_by_minor(minor: u32) -> Option<Arc<InputDevice>> {
    DEVICES.lock().iter().find(|d| d.minor == minor).cloned()
}

impl InputDevice {
    /// Installs a filter ahead of the listeners.
    pub fn add_handler(&self, handler: InputHandlerFn) {
        self.handlers.lock().push(handler);
    }

    /// Creates a listener attached to this device.
    #[must_use]
    pub fn add_listener(&self) -> Arc<InputListener> {
        let listener = InputListener::new();
        self.listeners.lock().push(listener.clone());
        listener
    }

    /// Driver entry point: pushes one event.
    ///
    /// Runs the filter chain inline; delivery to listeners happens
    /// immediately in task context, or at interrupt exit when called
    /// from an IRQ handler.
    pub fn push_key_event(&self, event: InputEvent) {
        for handler in self.handlers.lock().iter() {
            if handler(&event) {
                return;
            }
        }
        self.safe_notify_listeners(event);
    }

    fn safe_notify_listeners(&self, event: InputEvent) {
        if boson_sched::scheduler().irq_depth() > 0 {
            let mut deferred = DEFERRED.lock();
            if deferred.try_push((self.minor, event)).is_err() {
                let _ = deferred.pop();
                let _ = deferred.try_push((self.minor, event));
            }
        } else {
            self.deliver(event);
        }
    }

    fn deliver(&self, event: InputEvent) {
        for listener in self.listeners.lock().iter() {
            listener.push(event);
            listener.wait.wake_all();
        }
    }
}

/// Drains events deferred from IRQ context. Called on interrupt exit.
pub fn run_deferred() {
    loop {
        let next = DEFERRED.lock().pop();
        let Some((minor, event)) = next else {
            return;
        };
        if let Some(device) = device_by_minor(minor) {
            device.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ev(code: u16) -> InputEvent {
        InputEvent {
            event_type: 1,
            action: 1,
            code,
            timestamp: 0,
        }
    }

    #[test]
    fn listeners_receive_unconsumed_events() {
        crate::test_support::install_frames();
        let dev = register_device(String::from("kbd-test")).unwrap();
        let listener = dev.add_listener();
        assert!(!listener.has_events());

        dev.push_key_event(ev(30));
        assert!(listener.has_events());
        assert_eq!(listener.pop_event().unwrap().code, 30);
        assert!(listener.pop_event().is_none());
    }

    #[test]
    fn handlers_can_consume_events() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn swallow_escape(event: &InputEvent) -> bool {
            SEEN.fetch_add(1, Ordering::SeqCst);
            event.code == 1
        }

        crate::test_support::install_frames();
        let dev = register_device(String::from("kbd-filter")).unwrap();
        let listener = dev.add_listener();
        dev.add_handler(swallow_escape);

        dev.push_key_event(ev(1)); // consumed by the filter
        assert!(!listener.has_events());
        dev.push_key_event(ev(2)); // passes through
        assert_eq!(listener.pop_event().unwrap().code, 2);
        assert_eq!(SEEN.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_ring_drops_oldest_on_overflow() {
        crate::test_support::install_frames();
        let dev = register_device(String::from("kbd-flood")).unwrap();
        let listener = dev.add_listener();
        for code in 0..(LISTENER_RING as u16 + 10) {
            dev.push_key_event(ev(code));
        }
        // The oldest events were dropped; the newest survived.
        let first = listener.pop_event().unwrap();
        assert!(first.code > 0);
        let mut last = first;
        while let Some(event) = listener.pop_event() {
            last = event;
        }
        assert_eq!(last.code, LISTENER_RING as u16 + 9);
    }

    #[test]
    fn minors_are_sequential() {
        crate::test_support::install_frames();
        let a = register_device(String::from("dev-a")).unwrap();
        let b = register_device(String::from("dev-b")).unwrap();
        assert!(b.minor > a.minor);
        assert!(device_by_minor(a.minor).is_some());
    }
}
