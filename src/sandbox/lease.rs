//! Scoped ownership of a sandbox session
//!
//! The controller keeps its session inside a [`SandboxLease`]. The normal
//! path calls [`SandboxLease::finish`] and awaits the release. If the lease
//! is dropped without that (task aborted, panic unwinding past it), `Drop`
//! spawns the release on the current runtime. Either way the session is
//! handed to [`SandboxManager::release`] exactly once.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{error, warn};

use super::{SandboxError, SandboxManager, SandboxSession};

pub struct SandboxLease {
    manager: Arc<dyn SandboxManager>,
    session: Option<SandboxSession>,
}

impl SandboxLease {
    pub fn new(manager: Arc<dyn SandboxManager>, session: SandboxSession) -> Self {
        Self {
            manager,
            session: Some(session),
        }
    }

    /// The leased session
    pub fn session(&self) -> Option<&SandboxSession> {
        self.session.as_ref()
    }

    /// Release the session now
    pub async fn finish(mut self) -> Result<(), SandboxError> {
        match self.session.take() {
            Some(session) => self.manager.release(session).await,
            None => Ok(()),
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox = %session.name, "Sandbox lease dropped unreleased, releasing in background");
                let manager = Arc::clone(&self.manager);
                handle.spawn(async move {
                    let name = session.name.clone();
                    if let Err(e) = manager.release(session).await {
                        error!(sandbox = %name, error = %e, "Background sandbox release failed");
                    }
                });
            }
            Err(_) => {
                error!(sandbox = %session.name, "No runtime to release sandbox; environment leaked");
            }
        }
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("manager", &self.manager.name())
            .field("session", &self.session)
            .finish()
    }
}
