//!
//! The process-wide object registry: owns every `Object`, hands out
//! stable `Handle`s, and is the only place link/unlink/insert/remove
//! happen.
//!
//! Structured as an `Arc<Mutex<HashMap<...>>>` inventory, generalized from
//! a name-keyed map to a handle-keyed one so objects can be linked by
//! reference without borrowing each other directly.
//!

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::object::{Handle, Object, ObjectKind};

/// The guarded contents of the registry. Exposed through `Registry::lock`
/// so callers can batch several operations (e.g. the mux's per-pass
/// sweep) under a single critical section when that is cheaper than
/// re-locking per object.
pub struct Inner {
    objects: HashMap<Handle, Object>,
    next_id: u64,
}

impl Inner {
    fn alloc_handle(&mut self) -> Handle {
        let h = Handle(self.next_id);
        self.next_id += 1;
        h
    }

    /// Inserts a freshly-built object (via `make`, which receives the
    /// handle it will be stored under so it can stamp `Object::id`) and
    /// returns its handle.
    pub fn insert(&mut self, make: impl FnOnce(Handle) -> Object) -> Handle {
        let handle = self.alloc_handle();
        let obj = make(handle);
        debug_assert_eq!(obj.id, handle);
        self.objects.insert(handle, obj);
        handle
    }

    pub fn get(&self, h: Handle) -> Option<&Object> {
        self.objects.get(&h)
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut Object> {
        self.objects.get_mut(&h)
    }

    pub fn contains(&self, h: Handle) -> bool {
        self.objects.contains_key(&h)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Handle, &Object)> {
        self.objects.iter()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.objects.keys().copied().collect()
    }

    pub fn find_by_name(&self, kind: ObjectKind, name: &str) -> Option<Handle> {
        self.objects
            .values()
            .find(|o| o.kind() == kind && o.name == name)
            .map(|o| o.id)
    }

    pub fn consoles(&self) -> Vec<Handle> {
        self.objects
            .values()
            .filter(|o| o.attrs.is_console())
            .map(|o| o.id)
            .collect()
    }

    /// Links `from -> to`: bytes read from `from` are appended into `to`'s
    /// ring. Inserts `to` into `from.readers` and `from` into `to.writers`
    /// together, so there are never dangling half-edges.
    ///
    /// Fails with `Error::WriterConflict` when `to` is a CONSOLE that
    /// already has a different writer and `force` is false. Passing
    /// `force = true` does not itself displace the existing writer —
    /// callers that want forced displacement must
    /// `unlink` the old writer first (see `mux::force_displace`).
    pub fn link(&mut self, from: Handle, to: Handle, force: bool) -> Result<()> {
        if !self.objects.contains_key(&from) || !self.objects.contains_key(&to) {
            return Err(Error::StaleHandle);
        }
        {
            let to_obj = &self.objects[&to];
            if to_obj.attrs.is_console() {
                if let Some(existing) = to_obj.console_writer() {
                    let from_is_client_writer = matches!(
                        self.objects.get(&from).map(|o| o.kind()),
                        Some(ObjectKind::Client)
                    );
                    if from_is_client_writer && existing != from && !force {
                        return Err(Error::WriterConflict);
                    }
                }
            }
        }
        self.objects.get_mut(&from).unwrap().readers.insert(to);
        self.objects.get_mut(&to).unwrap().writers.insert(from);
        Ok(())
    }

    /// Removes both halves of the `from -> to` edge. A CONSOLE that loses
    /// all readers and its writer is *not* destroyed — consoles outlive
    /// sessions; a CLIENT that loses all links is removed from the
    /// registry.
    pub fn unlink(&mut self, from: Handle, to: Handle) {
        if let Some(o) = self.objects.get_mut(&from) {
            o.readers.remove(&to);
        }
        if let Some(o) = self.objects.get_mut(&to) {
            o.writers.remove(&from);
        }
        self.retire_if_orphaned_client(from);
        self.retire_if_orphaned_client(to);
    }

    /// Removes every edge touching `handle` (both directions) and, unless
    /// it is a LISTEN/CONSOLE object, removes it from the registry. Used
    /// on EOF/fatal error and client-initiated
    /// disconnect.
    pub fn detach_and_remove(&mut self, handle: Handle) {
        let (readers, writers): (Vec<Handle>, Vec<Handle>) = match self.objects.get(&handle) {
            Some(o) => (o.readers.iter().copied().collect(), o.writers.iter().copied().collect()),
            None => return,
        };
        for r in &readers {
            if let Some(o) = self.objects.get_mut(r) {
                o.writers.remove(&handle);
            }
        }
        for w in &writers {
            if let Some(o) = self.objects.get_mut(w) {
                o.readers.remove(&handle);
            }
        }
        let kind = self.objects.get(&handle).map(|o| o.kind());
        match kind {
            Some(ObjectKind::ConsoleTty) | Some(ObjectKind::ConsoleSocket) | Some(ObjectKind::Listen) => {
                // Consoles and the listener are not destroyed by session
                // lifecycle; just clear their edges (already done above).
            }
            _ => {
                self.objects.remove(&handle);
            }
        }
    }

    fn retire_if_orphaned_client(&mut self, handle: Handle) {
        let should_remove = match self.objects.get(&handle) {
            Some(o) if o.kind() == ObjectKind::Client => o.readers.is_empty() && o.writers.is_empty(),
            _ => false,
        };
        if should_remove {
            self.objects.remove(&handle);
        }
    }
}

/// The registry itself: a single mutex around `Inner`, guarded only
/// during insert/remove/link/unlink. The mux also takes this lock for the
/// span of one pass so it can mutate ring buffers directly without a
/// second layer of per-object locking — per-object ring buffers are not
/// locked on their own, since only the mux reads or writes them after
/// insertion.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry mutex poisoned")
    }

    pub fn insert(&self, make: impl FnOnce(Handle) -> Object) -> Handle {
        self.lock().insert(make)
    }

    pub fn link(&self, from: Handle, to: Handle, force: bool) -> Result<()> {
        self.lock().link(from, to, force)
    }

    pub fn unlink(&self, from: Handle, to: Handle) {
        self.lock().unlink(from, to)
    }

    pub fn detach_and_remove(&self, handle: Handle) {
        self.lock().detach_and_remove(handle)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Attrs as A, ClientAttrs, ConsoleTtyAttrs, EscapeState, Parity};
    use std::net::SocketAddr;

    fn make_client(reg: &Registry, name: &str) -> Handle {
        reg.insert(|id| {
            Object::new(
                id,
                name,
                None,
                A::Client(ClientAttrs {
                    remote_ip: "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
                    remote_host: None,
                    user: "u".into(),
                    write_enabled: false,
                    broadcast: false,
                    escape_state: EscapeState::Idle,
                    quiet: false,
                    requested_join: false,
                    linked_logfile: None,
                }),
            )
        })
    }

    fn make_console(reg: &Registry, name: &str) -> Handle {
        reg.insert(|id| {
            Object::new(
                id,
                name,
                None,
                A::ConsoleTty(ConsoleTtyAttrs {
                    device_path: format!("/dev/{}", name),
                    baud: 9600,
                    parity: Parity::None,
                    stop_bits: 1,
                    logfile: None,
                }),
            )
        })
    }

    #[test]
    fn graph_symmetry_after_link_unlink() {
        let reg = Registry::new();
        let c = make_client(&reg, "cl");
        let console = make_console(&reg, "A");
        reg.link(c, console, false).unwrap();
        {
            let g = reg.lock();
            assert!(g.get(c).unwrap().readers.contains(&console));
            assert!(g.get(console).unwrap().writers.contains(&c));
        }
        reg.unlink(c, console);
        let g = reg.lock();
        // client had no other links, so it was retired; console survives.
        assert!(!g.contains(c));
        assert!(g.contains(console));
        assert!(g.get(console).unwrap().writers.is_empty());
    }

    #[test]
    fn exclusive_writer_enforced() {
        let reg = Registry::new();
        let c1 = make_client(&reg, "c1");
        let c2 = make_client(&reg, "c2");
        let console = make_console(&reg, "A");
        reg.link(c1, console, false).unwrap();
        let err = reg.link(c2, console, false);
        assert!(err.is_err());
        // force bypasses the check at the link layer (displacement itself
        // is the mux's job, see mux::force_displace).
        assert!(reg.link(c2, console, true).is_ok());
    }

    #[test]
    fn console_survives_losing_all_clients() {
        let reg = Registry::new();
        let c = make_client(&reg, "cl");
        let console = make_console(&reg, "A");
        reg.link(c, console, false).unwrap();
        reg.detach_and_remove(c);
        let g = reg.lock();
        assert!(g.contains(console));
        assert!(g.get(console).unwrap().writers.is_empty());
    }
}
