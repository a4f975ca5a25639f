//! A pool of SSH connections, keyed by `user@address:port`.
//!
//! Connections are handed out as [`PooledShell`] guards. A guard returns its connection to the
//! pool when dropped, unless it has been marked broken, in which case the connection is closed.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use spurs::{SshError, SshShell};

use crate::lock;

/// The number of idle connections kept per target.
pub const DEFAULT_MAX_IDLE: usize = 4;

/// Everything needed to open a connection to a host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub username: String,
    pub address: String,
    pub port: u16,
    pub key: Option<PathBuf>,
}

impl Target {
    /// `address:port`, as `ssh` and spurs expect it.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }
}

type Idle = Arc<Mutex<HashMap<String, Vec<SshShell>>>>;

#[derive(Clone)]
pub struct ConnectionPool {
    idle: Idle,
    max_idle: usize,
}

impl ConnectionPool {
    pub fn new(max_idle: usize) -> Self {
        ConnectionPool {
            idle: Arc::new(Mutex::new(HashMap::new())),
            max_idle,
        }
    }

    /// Take an idle connection to `target`, or open a new one.
    pub fn acquire(&self, target: &Target) -> Result<PooledShell, SshError> {
        let key = target.pool_key();

        let reused = lock(&self.idle).get_mut(&key).and_then(Vec::pop);
        let shell = match reused {
            Some(shell) => shell,
            None => Self::connect(target)?,
        };

        Ok(PooledShell {
            shell: Some(shell),
            key,
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
            broken: false,
        })
    }

    /// Open a fresh connection that bypasses the pool.
    pub fn acquire_fresh(&self, target: &Target) -> Result<PooledShell, SshError> {
        let shell = Self::connect(target)?;
        Ok(PooledShell {
            shell: Some(shell),
            key: target.pool_key(),
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
            broken: false,
        })
    }

    fn connect(target: &Target) -> Result<SshShell, SshError> {
        log::debug!("connecting to {}", target.pool_key());
        match &target.key {
            Some(key) => SshShell::with_key(&target.username, target.remote(), key),
            None => SshShell::with_default_key(&target.username, target.remote()),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(DEFAULT_MAX_IDLE)
    }
}

/// A connection borrowed from a [`ConnectionPool`].
pub struct PooledShell {
    shell: Option<SshShell>,
    key: String,
    idle: Idle,
    max_idle: usize,
    broken: bool,
}

impl PooledShell {
    /// Close this connection instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledShell {
    type Target = SshShell;

    fn deref(&self) -> &SshShell {
        // Only `drop` takes the shell out.
        self.shell.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledShell {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        if let Some(shell) = self.shell.take() {
            let mut idle = lock(&self.idle);
            let conns = idle.entry(std::mem::take(&mut self.key)).or_default();
            if conns.len() < self.max_idle {
                conns.push(shell);
            }
        }
    }
}
