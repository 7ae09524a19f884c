//! User-store checkout pool and the login/register verification that the
//! form-POST endpoint runs through it.
//!
//! The real database stays outside the core: its whole contract is
//! "borrow a connection, run one query, return it", captured by
//! [`UserStore`] plus the semaphore-gated [`ConnPool`] whose RAII guard
//! returns the handle on drop. [`MemoryStore`] is the in-tree
//! implementation.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info};

/// One borrowed store handle's query surface.
pub trait UserStore: Send + std::fmt::Debug {
    /// Password stored for `name`, if the user exists.
    fn find_password(&mut self, name: &str) -> Option<String>;

    /// Records a new user; fails if the name is taken or the store
    /// rejects the write.
    fn insert_user(&mut self, name: &str, password: &str) -> bool;
}

/// Fixed set of store handles with blocking checkout and scoped return.
#[derive(Debug)]
pub struct ConnPool<S> {
    idle: Mutex<VecDeque<S>>,
    available: Condvar,
}

impl<S> ConnPool<S> {
    /// Wraps `conns` as the pool's full capacity.
    pub fn new(conns: Vec<S>) -> ConnPool<S> {
        ConnPool {
            idle: Mutex::new(conns.into()),
            available: Condvar::new(),
        }
    }

    /// Borrows a handle, blocking until one is idle.
    pub fn get(&self) -> PooledConn<'_, S> {
        let mut idle = self.idle.lock().unwrap();
        while idle.is_empty() {
            idle = self.available.wait(idle).unwrap();
        }
        PooledConn {
            pool: self,
            conn: idle.pop_front(),
        }
    }

    /// Number of handles currently checked in.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn put_back(&self, conn: S) {
        self.idle.lock().unwrap().push_back(conn);
        self.available.notify_one();
    }
}

/// RAII checkout guard; hands the connection back on drop.
#[derive(Debug)]
pub struct PooledConn<'a, S> {
    pool: &'a ConnPool<S>,
    conn: Option<S>,
}

impl<S> Deref for PooledConn<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl<S> DerefMut for PooledConn<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl<S> Drop for PooledConn<'_, S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

/// The pool shape the request parser verifies against.
pub type UserPool = ConnPool<Box<dyn UserStore>>;

/// In-memory user store; every handle from [`shared`](Self::shared) sees
/// the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    /// `count` handles over one shared table, boxed for the pool.
    pub fn shared(count: usize) -> Vec<Box<dyn UserStore>> {
        let store = MemoryStore::default();
        (0..count.max(1))
            .map(|_| Box::new(store.clone()) as Box<dyn UserStore>)
            .collect()
    }
}

impl UserStore for MemoryStore {
    fn find_password(&mut self, name: &str) -> Option<String> {
        self.users.lock().unwrap().get(name).cloned()
    }

    fn insert_user(&mut self, name: &str, password: &str) -> bool {
        match self.users.lock().unwrap().entry(name.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(password.to_owned());
                true
            }
        }
    }
}

/// Checks a submitted name/password pair against the store. Login
/// requires a matching stored password; register requires an unused name
/// and records it. Empty credentials always fail.
pub fn verify_user(users: &UserPool, name: &str, password: &str, is_login: bool) -> bool {
    if name.is_empty() || password.is_empty() {
        return false;
    }
    info!("verify user '{name}' (login: {is_login})");
    let mut conn = users.get();
    let ok = match conn.find_password(name) {
        Some(stored) => {
            if !is_login {
                debug!("user '{name}' already taken");
                false
            } else if stored == password {
                true
            } else {
                debug!("password mismatch for '{name}'");
                false
            }
        }
        None => !is_login && conn.insert_user(name, password),
    };
    debug!("verify user '{name}' -> {ok}");
    ok
}
