/**
 * ÉTAT PARTAGÉ - Primitives de concurrence du kernel Weft
 *
 * RÔLE : Deux formes d'état partagé entre workers :
 * - Slot<T> : cellule de publication atomique pour les snapshots
 *   rechargeables (le Catalog) ; un écrivain remplace, les lecteurs
 *   clonent l'Arc courant et le gardent pour la durée d'une opération
 * - Shared<T> : état mutable à verrou court, jamais tenu à travers
 *   un await
 */

use parking_lot::Mutex;
use std::sync::Arc;

/// Cellule de publication : swap atomique d'un snapshot immuable.
/// Les lecteurs en vol continuent sur l'Arc qu'ils tiennent.
pub struct Slot<T> {
    current: Mutex<Arc<T>>,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Self { current: Mutex::new(Arc::new(value)) }
    }

    /// Snapshot courant, à tenir pour la durée d'une opération
    pub fn get(&self) -> Arc<T> {
        self.current.lock().clone()
    }

    /// Publie un snapshot neuf sans toucher aux lecteurs en vol
    pub fn publish(&self, value: T) {
        *self.current.lock() = Arc::new(value);
    }
}

/// État mutable partagé entre workers
pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_readers_keep_their_snapshot() {
        let slot = Slot::new(vec![1, 2, 3]);
        let held = slot.get();
        slot.publish(vec![9]);

        // Le lecteur en vol garde l'ancien snapshot, les nouveaux voient
        // la publication
        assert_eq!(*held, vec![1, 2, 3]);
        assert_eq!(*slot.get(), vec![9]);
    }

    #[test]
    fn test_shared_roundtrip() {
        let counter = shared(0u32);
        *counter.lock() += 2;
        assert_eq!(*counter.lock(), 2);
    }
}
