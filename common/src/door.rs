use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use crate::types::{ActionKind, DoorState};

/// Hardware or system action wired to one [`ActionKind`].
pub type Delegate = Arc<dyn Fn() + Send + Sync>;

/// In-memory door state reachable only through the named actions.
///
/// `open()` and `close()` assume their delegate succeeded and update the
/// tracked state afterwards. `toggle()` leaves the tracked state alone since
/// the resulting position is decided by the hardware. Any action without a
/// delegate is a no-op.
pub struct DoorController {
    is_open: AtomicBool,
    delegates: Mutex<[Option<Delegate>; 5]>,
}

impl Default for DoorController {
    fn default() -> Self {
        Self::new()
    }
}

impl DoorController {
    pub fn new() -> Self {
        Self {
            is_open: AtomicBool::new(false),
            delegates: Mutex::new([None, None, None, None, None]),
        }
    }

    /// Replaces whatever delegate was registered for `kind`.
    pub fn register<F>(&self, kind: ActionKind, delegate: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register_shared(kind, Arc::new(delegate));
    }

    pub fn register_shared(&self, kind: ActionKind, delegate: Delegate) {
        let mut slots = self
            .delegates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots[kind.index()] = Some(delegate);
    }

    pub fn on_toggle<F: Fn() + Send + Sync + 'static>(&self, delegate: F) {
        self.register(ActionKind::Toggle, delegate);
    }

    pub fn on_open<F: Fn() + Send + Sync + 'static>(&self, delegate: F) {
        self.register(ActionKind::Open, delegate);
    }

    pub fn on_close<F: Fn() + Send + Sync + 'static>(&self, delegate: F) {
        self.register(ActionKind::Close, delegate);
    }

    pub fn on_reset<F: Fn() + Send + Sync + 'static>(&self, delegate: F) {
        self.register(ActionKind::Reset, delegate);
    }

    pub fn on_restart<F: Fn() + Send + Sync + 'static>(&self, delegate: F) {
        self.register(ActionKind::Restart, delegate);
    }

    pub fn has_delegate(&self, kind: ActionKind) -> bool {
        self.delegate(kind).is_some()
    }

    pub fn toggle(&self) {
        self.invoke(ActionKind::Toggle);
    }

    pub fn open(&self) {
        if self.invoke(ActionKind::Open) {
            self.is_open.store(true, Ordering::SeqCst);
        }
    }

    pub fn close(&self) {
        if self.invoke(ActionKind::Close) {
            self.is_open.store(false, Ordering::SeqCst);
        }
    }

    pub fn reset(&self) {
        self.invoke(ActionKind::Reset);
    }

    pub fn restart(&self) {
        self.invoke(ActionKind::Restart);
    }

    pub fn perform(&self, kind: ActionKind) {
        match kind {
            ActionKind::Toggle => self.toggle(),
            ActionKind::Open => self.open(),
            ActionKind::Close => self.close(),
            ActionKind::Reset => self.reset(),
            ActionKind::Restart => self.restart(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DoorState {
        DoorState {
            open: self.is_open(),
        }
    }

    /// `{"open":<bool>}`, the body of `/state` and every action route.
    pub fn serialize_state(&self) -> String {
        // A bool-only struct always serializes.
        serde_json::to_string(&self.state()).unwrap_or_default()
    }

    // The slot lock is released before the delegate runs so a delegate may
    // call back into the controller.
    fn invoke(&self, kind: ActionKind) -> bool {
        match self.delegate(kind) {
            Some(delegate) => {
                delegate();
                true
            }
            None => false,
        }
    }

    fn delegate(&self, kind: ActionKind) -> Option<Delegate> {
        self.delegates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[kind.index()]
        .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn starts_closed() {
        let door = DoorController::new();
        assert!(!door.is_open());
        assert_eq!(door.state(), DoorState { open: false });
    }

    #[test]
    fn actions_without_delegates_do_nothing() {
        let door = DoorController::new();
        door.open();
        assert!(!door.is_open());
        door.toggle();
        door.reset();
        door.restart();
        door.close();
        assert!(!door.is_open());
    }

    #[test]
    fn open_and_close_follow_last_backed_call() {
        let door = DoorController::new();
        door.on_open(|| {});
        door.on_close(|| {});

        door.open();
        assert!(door.is_open());
        door.close();
        assert!(!door.is_open());
        door.open();
        door.open();
        assert!(door.is_open());
    }

    #[test]
    fn close_without_delegate_keeps_door_open() {
        let door = DoorController::new();
        door.on_open(|| {});

        door.open();
        door.close();

        assert!(door.is_open());
    }

    #[test]
    fn toggle_runs_delegate_but_keeps_tracked_state() {
        let door = DoorController::new();
        let (count, delegate) = counter();
        door.on_toggle(delegate);

        door.toggle();
        door.toggle();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!door.is_open());

        door.on_open(|| {});
        door.open();
        door.toggle();
        assert!(door.is_open());
    }

    #[test]
    fn second_registration_replaces_first() {
        let door = DoorController::new();
        let (first, first_delegate) = counter();
        let (second, second_delegate) = counter();

        door.on_restart(first_delegate);
        door.on_restart(second_delegate);
        door.restart();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_and_restart_leave_state_alone() {
        let door = DoorController::new();
        let (resets, reset_delegate) = counter();
        door.on_reset(reset_delegate);
        door.on_restart(|| {});
        door.on_open(|| {});

        door.open();
        door.reset();
        door.restart();

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert!(door.is_open());
    }

    #[test]
    fn perform_dispatches_by_kind() {
        let door = DoorController::new();
        let (toggles, toggle_delegate) = counter();
        door.on_toggle(toggle_delegate);
        door.on_open(|| {});

        door.perform(ActionKind::Toggle);
        door.perform(ActionKind::Open);

        assert_eq!(toggles.load(Ordering::SeqCst), 1);
        assert!(door.is_open());
        assert!(door.has_delegate(ActionKind::Open));
        assert!(!door.has_delegate(ActionKind::Close));
    }

    #[test]
    fn delegate_may_reenter_controller() {
        let door = Arc::new(DoorController::new());
        let inner = door.clone();
        door.on_toggle(move || {
            if inner.is_open() {
                inner.close();
            } else {
                inner.open();
            }
        });
        door.on_open(|| {});
        door.on_close(|| {});

        door.toggle();
        assert!(door.is_open());
        door.toggle();
        assert!(!door.is_open());
    }

    #[test]
    fn serialized_state_round_trips() {
        let door = DoorController::new();
        assert_eq!(door.serialize_state(), r#"{"open":false}"#);

        door.on_open(|| {});
        door.open();
        let json = door.serialize_state();
        assert_eq!(json, r#"{"open":true}"#);

        let parsed: DoorState = serde_json::from_str(&json).unwrap();
        assert!(parsed.open);
        assert_eq!(serde_json::to_string(&door.state()).unwrap(), json);
    }
}
